#![forbid(unsafe_code)]

//! Uploads one video to YouTube.
//!
//! Metadata comes from flags and/or a YAML/JSON/TOML file (file values win).
//! The first run asks for consent in a browser (or via a device code) and
//! stores the token; later runs reuse or refresh it without prompting.

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use log::warn;
use newtube_uploader::{
    config,
    error::{EXIT_FAILURE, Error},
    metadata::{self, PartialMetadata, Scalar, TagsInput},
    oauth::{CredentialManager, InteractiveConsent, OAuthEndpoint},
    token::{SCOPES, TokenStore},
    upload,
    youtube::YouTubeClient,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Upload a video to YouTube using OAuth.")]
struct Cli {
    #[arg(long = "file", value_name = "PATH", help = "Path to the video file")]
    file: Option<PathBuf>,
    #[arg(long = "title", value_name = "TEXT", help = "Video title")]
    title: Option<String>,
    #[arg(long = "description", value_name = "TEXT", help = "Video description")]
    description: Option<String>,
    #[arg(
        long = "tags",
        value_name = "TAGS",
        help = "Comma separated tags or a JSON array of tags"
    )]
    tags: Option<String>,
    #[arg(
        long = "category-id",
        value_name = "ID",
        help = "Numeric YouTube category id (default 22)"
    )]
    category_id: Option<String>,
    #[arg(
        long = "privacy",
        value_name = "STATUS",
        value_parser = ["public", "unlisted", "private"],
        help = "Privacy status (default unlisted)"
    )]
    privacy: Option<String>,
    #[arg(long = "thumbnail", value_name = "PATH", help = "Thumbnail image to set")]
    thumbnail: Option<PathBuf>,
    #[arg(long = "playlist-id", value_name = "ID", help = "Playlist to add the video to")]
    playlist_id: Option<String>,
    #[arg(
        long = "publish-at",
        value_name = "TIME",
        help = "Scheduled publish time, e.g. '2025-01-31 14:30' (local) or RFC 3339"
    )]
    publish_at: Option<String>,
    #[arg(long = "made-for-kids", help = "Mark the video as made for kids")]
    made_for_kids: bool,
    #[arg(
        long = "metadata",
        value_name = "PATH",
        help = "YAML/JSON/TOML file whose fields override the flags"
    )]
    metadata: Option<PathBuf>,
    #[arg(
        long = "client-secrets",
        value_name = "PATH",
        help = "OAuth client JSON; else $YT_CLIENT_SECRETS or client_secret.json"
    )]
    client_secrets: Option<PathBuf>,
    #[arg(
        long = "token-file",
        value_name = "PATH",
        help = "Where the OAuth token is stored; else $YT_TOKEN_FILE or token_youtube_upload.json"
    )]
    token_file: Option<PathBuf>,
    #[arg(long = "no-browser", help = "Authorize with a device code instead of a browser")]
    no_browser: bool,
    #[arg(long = "dry-run", help = "Validate and print the request without uploading")]
    dry_run: bool,
}

impl Cli {
    fn to_partial(&self) -> PartialMetadata {
        PartialMetadata {
            file: self.file.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            tags: self.tags.clone().map(TagsInput::Text),
            category_id: self.category_id.clone().map(Scalar::Text),
            privacy: self.privacy.clone(),
            thumbnail: self.thumbnail.clone(),
            playlist_id: self.playlist_id.clone(),
            publish_at: self.publish_at.clone(),
            made_for_kids: self.made_for_kids.then_some(true),
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(&cli, |key| std::env::var(key).ok()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    let code = err
        .downcast_ref::<Error>()
        .map_or(EXIT_FAILURE, Error::exit_code);
    u8::try_from(code).unwrap_or(1)
}

fn merged_record(cli: &Cli) -> Result<metadata::VideoMetadata> {
    let from_file = match cli.metadata.as_deref() {
        Some(path) => metadata::load_metadata_file(path)?,
        None => PartialMetadata::default(),
    };
    let record = PartialMetadata::merge(cli.to_partial(), from_file).validate()?;
    record.ensure_video_exists()?;
    Ok(record)
}

fn run<F>(cli: &Cli, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let record = merged_record(cli)?;

    if cli.dry_run {
        let body = serde_json::to_string_pretty(&upload::build_request(&record))
            .context("rendering request body")?;
        println!("{body}");
        return Ok(());
    }

    let paths = config::resolve_paths(cli.client_secrets.clone(), cli.token_file.clone(), env);
    let client = config::load_client_config(&paths.client_secrets)?;

    let endpoint = OAuthEndpoint::new(client);
    let consent = InteractiveConsent::new(&endpoint, !cli.no_browser);
    let token = CredentialManager::new(
        TokenStore::new(paths.token_file),
        &endpoint,
        &consent,
        SCOPES,
    )
    .authorize()?;

    let service = YouTubeClient::new(&token);
    let result = upload::upload(&service, &record)?;
    println!("Uploaded video ID: {}", result.video_id);
    println!("Watch URL: {}", result.watch_url());

    let report = upload::run_post_actions(&service, &result.video_id, &record);
    println!("Thumbnail: {}", report.thumbnail);
    println!("Playlist: {}", report.playlist);
    if report.has_failures() {
        warn!("video {} was created, but some post-upload actions failed", result.video_id);
    }
    Ok(())
}
