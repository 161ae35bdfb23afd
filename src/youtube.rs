//! Minimal client for the YouTube Data API v3 write endpoints we need:
//! resumable video insert, thumbnail set, and playlist item insert.
//!
//! Only the fields we send or read are modelled. Every call returns an
//! [`ApiError`] on failure so callers can tell transient trouble from a
//! request the platform will never accept.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{error::ApiError, token::StoredToken};

pub const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/youtube/v3";

/// Size of each resumable chunk. Must be a multiple of 256 KiB.
pub const CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Request body of `videos.insert` with `part=snippet,status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInsert {
    pub snippet: VideoSnippet,
    pub status: VideoStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnippet {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoStatus {
    pub privacy_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_at: Option<String>,
    pub self_declared_made_for_kids: bool,
}

/// The part of the returned video resource we care about.
#[derive(Debug, Deserialize)]
struct InsertedResource {
    id: Option<String>,
}

/// Error envelope returned by Google APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: Option<String>,
}

/// Pulls `(reason, message)` out of a Google error body, if it is one.
pub fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => (
            envelope
                .error
                .errors
                .into_iter()
                .find_map(|item| item.reason),
            envelope.error.message,
        ),
        Err(_) => (None, None),
    }
}

fn api_error(err: ureq::Error) -> ApiError {
    match err {
        ureq::Error::Status(code, resp) => {
            let body = resp.into_string().unwrap_or_default();
            let (reason, message) = parse_error_body(&body);
            let message = message.unwrap_or_else(|| {
                if body.trim().is_empty() {
                    format!("HTTP {code}")
                } else {
                    body.trim().to_string()
                }
            });
            ApiError::from_status(code, reason, message)
        }
        ureq::Error::Transport(transport) => ApiError::transport(transport.to_string()),
    }
}

/// Parses the `Range` header of a 308 response (`bytes=0-1048575`) into the
/// next byte offset to send.
pub fn next_offset(range: Option<&str>) -> u64 {
    range
        .and_then(|value| value.trim().strip_prefix("bytes="))
        .and_then(|value| value.split_once('-'))
        .and_then(|(_, end)| end.trim().parse::<u64>().ok())
        .map_or(0, |end| end + 1)
}

pub fn mime_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Operations the uploader needs from the platform.
pub trait VideoService {
    /// Creates the video and streams `media` into it. Returns the video id.
    fn insert_video(&self, body: &VideoInsert, media: &Path) -> Result<String, ApiError>;
    fn set_thumbnail(&self, video_id: &str, image: &Path) -> Result<(), ApiError>;
    fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> Result<(), ApiError>;
}

enum ChunkOutcome {
    Continue(u64),
    Done(String),
}

/// Authorized HTTP client for one upload session.
#[derive(Debug, Clone)]
pub struct YouTubeClient {
    agent: ureq::Agent,
    authorization: String,
    api_base: String,
    upload_base: String,
}

impl YouTubeClient {
    pub fn new(token: &StoredToken) -> Self {
        Self::with_base_urls(token, API_BASE, UPLOAD_BASE)
    }

    pub fn with_base_urls(token: &StoredToken, api_base: &str, upload_base: &str) -> Self {
        // 308 is the resumable protocol's "keep going", not a redirect.
        let agent = ureq::AgentBuilder::new()
            .redirects(0)
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .timeout_write(Duration::from_secs(300))
            .build();
        Self {
            agent,
            authorization: format!("{} {}", token.token_type, token.access_token),
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
        }
    }

    fn start_session(&self, body: &VideoInsert, total: u64, mime: &str) -> Result<String, ApiError> {
        let resp = self
            .agent
            .post(&format!("{}/videos", self.upload_base))
            .query("uploadType", "resumable")
            .query("part", "snippet,status")
            .set("Authorization", &self.authorization)
            .set("X-Upload-Content-Length", &total.to_string())
            .set("X-Upload-Content-Type", mime)
            .send_json(body)
            .map_err(api_error)?;
        resp.header("Location")
            .map(str::to_string)
            .ok_or_else(|| ApiError::local("no upload session URL in the initiation response"))
    }

    fn send_chunk(
        &self,
        session: &str,
        file: &mut File,
        offset: u64,
        total: u64,
        mime: &str,
    ) -> Result<ChunkOutcome, ApiError> {
        let len = CHUNK_SIZE.min(total - offset);
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| ApiError::local(format!("seeking video file: {err}")))?;
        let resp = self
            .agent
            .put(session)
            .set("Authorization", &self.authorization)
            .set("Content-Type", mime)
            .set("Content-Length", &len.to_string())
            .set(
                "Content-Range",
                &format!("bytes {}-{}/{}", offset, offset + len - 1, total),
            )
            .send(file.take(len))
            .map_err(api_error)?;
        Self::chunk_outcome(resp)
    }

    /// Asks the server how much of the file it has committed.
    fn query_session(&self, session: &str, total: u64) -> Result<ChunkOutcome, ApiError> {
        let resp = self
            .agent
            .put(session)
            .set("Authorization", &self.authorization)
            .set("Content-Length", "0")
            .set("Content-Range", &format!("bytes */{total}"))
            .call()
            .map_err(api_error)?;
        Self::chunk_outcome(resp)
    }

    fn chunk_outcome(resp: ureq::Response) -> Result<ChunkOutcome, ApiError> {
        if resp.status() == 308 {
            return Ok(ChunkOutcome::Continue(next_offset(resp.header("Range"))));
        }
        let resource: InsertedResource = resp
            .into_json()
            .map_err(|err| ApiError::local(format!("decoding upload response: {err}")))?;
        resource
            .id
            .map(ChunkOutcome::Done)
            .ok_or_else(|| ApiError::local("upload response did not contain a video id"))
    }
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "Uploading [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

impl VideoService for YouTubeClient {
    fn insert_video(&self, body: &VideoInsert, media: &Path) -> Result<String, ApiError> {
        let mut file = File::open(media)
            .map_err(|err| ApiError::local(format!("opening {}: {err}", media.display())))?;
        let total = file
            .metadata()
            .map_err(|err| ApiError::local(format!("reading {}: {err}", media.display())))?
            .len();
        if total == 0 {
            return Err(ApiError::local(format!("{} is empty", media.display())));
        }
        let mime = mime_for(media);
        info!("uploading {} ({total} bytes, {mime})", media.display());

        let session = self.start_session(body, total, &mime)?;
        debug!("resumable session started");

        let bar = progress_bar(total);
        let mut offset = 0;
        let mut recovered = false;
        let result = loop {
            let (outcome, queried) = match self.send_chunk(&session, &mut file, offset, total, &mime) {
                Err(err) if err.transient && !recovered => {
                    recovered = true;
                    warn!("chunk at offset {offset} failed ({err}); resuming once");
                    (self.query_session(&session, total), true)
                }
                other => (other, false),
            };
            match outcome {
                // after a status query the committed offset may legitimately
                // stay where it was; after a sent chunk it must move forward
                Ok(ChunkOutcome::Continue(next)) if next >= total || (!queried && next <= offset) => {
                    break Err(ApiError::local(format!(
                        "upload session reported offset {next} after sending from {offset} of {total} bytes"
                    )));
                }
                Ok(ChunkOutcome::Continue(next)) => {
                    offset = next;
                    bar.set_position(offset);
                }
                Ok(ChunkOutcome::Done(id)) => break Ok(id),
                Err(err) => break Err(err),
            }
        };
        match &result {
            Ok(_) => bar.finish_with_message("done"),
            Err(_) => bar.abandon(),
        }
        result
    }

    fn set_thumbnail(&self, video_id: &str, image: &Path) -> Result<(), ApiError> {
        let file = File::open(image).map_err(|err| {
            ApiError::local(format!("thumbnail {} unreadable: {err}", image.display()))
        })?;
        let len = file
            .metadata()
            .map_err(|err| ApiError::local(format!("reading {}: {err}", image.display())))?
            .len();
        self.agent
            .post(&format!("{}/thumbnails/set", self.upload_base))
            .query("videoId", video_id)
            .query("uploadType", "media")
            .set("Authorization", &self.authorization)
            .set("Content-Type", &mime_for(image))
            .set("Content-Length", &len.to_string())
            .send(file)
            .map_err(api_error)?;
        Ok(())
    }

    fn add_to_playlist(&self, playlist_id: &str, video_id: &str) -> Result<(), ApiError> {
        self.agent
            .post(&format!("{}/playlistItems", self.api_base))
            .query("part", "snippet")
            .set("Authorization", &self.authorization)
            .send_json(json!({
                "snippet": {
                    "playlistId": playlist_id,
                    "resourceId": {"kind": "youtube#video", "videoId": video_id},
                }
            }))
            .map_err(api_error)?;
        Ok(())
    }
}
