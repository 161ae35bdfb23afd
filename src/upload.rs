//! Turning a validated record into a video: the insert request, the upload
//! itself, and the optional follow-up actions once an id exists.

use std::fmt;

use log::{info, warn};

use crate::{
    error::{Error, PostAction, Result},
    metadata::{VideoMetadata, format_publish_at},
    youtube::{VideoInsert, VideoService, VideoSnippet, VideoStatus},
};

pub const WATCH_URL: &str = "https://www.youtube.com/watch?v=";

/// Builds the `videos.insert` body from the canonical record.
pub fn build_request(meta: &VideoMetadata) -> VideoInsert {
    VideoInsert {
        snippet: VideoSnippet {
            title: meta.title.clone(),
            description: meta.description.clone(),
            tags: meta.tags.clone(),
            category_id: meta.category_id.clone(),
        },
        status: VideoStatus {
            privacy_status: meta.privacy.to_string(),
            publish_at: meta.publish_at.as_ref().map(format_publish_at),
            self_declared_made_for_kids: meta.made_for_kids,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub video_id: String,
}

impl UploadResult {
    pub fn watch_url(&self) -> String {
        format!("{WATCH_URL}{}", self.video_id)
    }
}

/// Creates the video. Not idempotent: calling this again after a failure
/// may leave a duplicate on the platform.
pub fn upload(service: &dyn VideoService, meta: &VideoMetadata) -> Result<UploadResult> {
    let body = build_request(meta);
    let video_id = service
        .insert_video(&body, &meta.file)
        .map_err(Error::Upload)?;
    info!("video created with id {video_id}");
    Ok(UploadResult { video_id })
}

/// How one post-upload action went.
#[derive(Debug)]
pub enum ActionStatus {
    Skipped,
    Done,
    Failed(Error),
}

impl ActionStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => f.write_str("skipped"),
            Self::Done => f.write_str("done"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

#[derive(Debug)]
pub struct PostActionReport {
    pub thumbnail: ActionStatus,
    pub playlist: ActionStatus,
}

impl PostActionReport {
    pub fn has_failures(&self) -> bool {
        self.thumbnail.is_failed() || self.playlist.is_failed()
    }
}

/// Runs the thumbnail and playlist steps. They are independent: one
/// failing never stops the other, and neither is retried.
pub fn run_post_actions(
    service: &dyn VideoService,
    video_id: &str,
    meta: &VideoMetadata,
) -> PostActionReport {
    let thumbnail = match meta.thumbnail.as_deref() {
        None => ActionStatus::Skipped,
        Some(path) => {
            let outcome = if path.is_file() {
                service.set_thumbnail(video_id, path)
            } else {
                Err(crate::error::ApiError::local(format!(
                    "thumbnail not found: {}",
                    path.display()
                )))
            };
            finish(PostAction::Thumbnail, video_id, outcome)
        }
    };
    let playlist = match meta.playlist_id.as_deref() {
        None => ActionStatus::Skipped,
        Some(playlist_id) => finish(
            PostAction::Playlist,
            video_id,
            service.add_to_playlist(playlist_id, video_id),
        ),
    };
    PostActionReport {
        thumbnail,
        playlist,
    }
}

fn finish(
    action: PostAction,
    video_id: &str,
    outcome: std::result::Result<(), crate::error::ApiError>,
) -> ActionStatus {
    match outcome {
        Ok(()) => {
            info!("{action} done for {video_id}");
            ActionStatus::Done
        }
        Err(source) => {
            let err = Error::PostAction {
                action,
                video_id: video_id.to_string(),
                source,
            };
            warn!("{err}");
            ActionStatus::Failed(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::metadata::{PartialMetadata, Privacy};
    use chrono::Utc;
    use std::cell::RefCell;
    use std::path::{Path, PathBuf};

    /// In-memory platform recording every call.
    #[derive(Default)]
    struct FakeService {
        insert_error: Option<ApiError>,
        thumbnail_error: Option<ApiError>,
        playlist_error: Option<ApiError>,
        calls: RefCell<Vec<String>>,
        bodies: RefCell<Vec<VideoInsert>>,
    }

    impl VideoService for FakeService {
        fn insert_video(&self, body: &VideoInsert, media: &Path) -> std::result::Result<String, ApiError> {
            self.calls
                .borrow_mut()
                .push(format!("insert {}", media.display()));
            self.bodies.borrow_mut().push(body.clone());
            match &self.insert_error {
                Some(err) => Err(err.clone()),
                None => Ok("vid123".into()),
            }
        }

        fn set_thumbnail(&self, video_id: &str, image: &Path) -> std::result::Result<(), ApiError> {
            self.calls
                .borrow_mut()
                .push(format!("thumbnail {video_id} {}", image.display()));
            self.thumbnail_error.clone().map_or(Ok(()), Err)
        }

        fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> std::result::Result<(), ApiError> {
            self.calls
                .borrow_mut()
                .push(format!("playlist {playlist_id} {video_id}"));
            self.playlist_error.clone().map_or(Ok(()), Err)
        }
    }

    fn record(tweak: impl FnOnce(&mut PartialMetadata)) -> VideoMetadata {
        let mut partial = PartialMetadata {
            file: Some(PathBuf::from("v.mp4")),
            title: Some("T".into()),
            ..Default::default()
        };
        tweak(&mut partial);
        partial.validate_in(&Utc).unwrap()
    }

    #[test]
    fn request_body_reflects_the_record() {
        let meta = record(|m| {
            m.tags = Some(crate::metadata::TagsInput::Text("a,b".into()));
            m.privacy = Some("public".into());
            m.publish_at = Some("2025-01-31 14:30".into());
            m.made_for_kids = Some(true);
        });
        assert_eq!(meta.privacy, Privacy::Private);
        let body = build_request(&meta);
        assert_eq!(body.snippet.title, "T");
        assert_eq!(body.snippet.tags, vec!["a", "b"]);
        assert_eq!(body.snippet.category_id, "22");
        assert_eq!(body.status.privacy_status, "private");
        assert_eq!(body.status.publish_at.as_deref(), Some("2025-01-31T14:30:00Z"));
        assert!(body.status.self_declared_made_for_kids);
    }

    #[test]
    fn upload_returns_the_video_id() {
        let service = FakeService::default();
        let result = upload(&service, &record(|_| {})).unwrap();
        assert_eq!(result.video_id, "vid123");
        assert_eq!(result.watch_url(), "https://www.youtube.com/watch?v=vid123");
        assert_eq!(service.calls.borrow().as_slice(), ["insert v.mp4"]);
        assert_eq!(service.bodies.borrow()[0].status.privacy_status, "unlisted");
    }

    #[test]
    fn upload_failure_is_an_upload_error_and_keeps_transience() {
        let service = FakeService {
            insert_error: Some(ApiError::from_status(503, Some("backendError".into()), "try later")),
            ..Default::default()
        };
        match upload(&service, &record(|_| {})) {
            Err(Error::Upload(err)) => assert!(err.transient),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn post_actions_are_skipped_when_not_requested() {
        let service = FakeService::default();
        let report = run_post_actions(&service, "vid123", &record(|_| {}));
        assert!(matches!(report.thumbnail, ActionStatus::Skipped));
        assert!(matches!(report.playlist, ActionStatus::Skipped));
        assert!(service.calls.borrow().is_empty());
        assert!(!report.has_failures());
    }

    #[test]
    fn post_actions_run_against_the_new_video() {
        let thumb = tempfile::Builder::new().suffix(".jpg").tempfile().unwrap();
        let thumb_path = thumb.path().to_path_buf();
        let service = FakeService::default();
        let meta = record(|m| {
            m.thumbnail = Some(thumb_path.clone());
            m.playlist_id = Some("PLabc".into());
        });
        let report = run_post_actions(&service, "vid123", &meta);
        assert!(matches!(report.thumbnail, ActionStatus::Done));
        assert!(matches!(report.playlist, ActionStatus::Done));
        let calls = service.calls.borrow();
        assert_eq!(calls[0], format!("thumbnail vid123 {}", thumb_path.display()));
        assert_eq!(calls[1], "playlist PLabc vid123");
    }

    #[test]
    fn one_failing_action_does_not_stop_the_other() {
        let service = FakeService {
            playlist_error: Some(ApiError::from_status(404, Some("playlistNotFound".into()), "no such playlist")),
            ..Default::default()
        };
        let meta = record(|m| {
            m.thumbnail = Some(PathBuf::from("/missing/thumb.png"));
            m.playlist_id = Some("PLgone".into());
        });
        let report = run_post_actions(&service, "vid123", &meta);
        assert!(report.has_failures());
        match &report.thumbnail {
            ActionStatus::Failed(Error::PostAction { action, .. }) => {
                assert_eq!(*action, PostAction::Thumbnail)
            }
            other => panic!("unexpected {other:?}"),
        }
        match &report.playlist {
            ActionStatus::Failed(err) => {
                assert_eq!(err.exit_code(), 0);
                assert!(err.to_string().contains("playlist insert"));
            }
            other => panic!("unexpected {other:?}"),
        }
        // the missing thumbnail never reached the service
        assert_eq!(service.calls.borrow().as_slice(), ["playlist PLgone vid123"]);
    }
}
