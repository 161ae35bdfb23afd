//! Video metadata: the partial records coming from the command line and the
//! metadata file, the precedence rule that combines them, and the validation
//! that turns the result into the canonical record used for the upload.
//!
//! The merge is deliberately dumb: [`PartialMetadata::merge`] is the only
//! place that decides which source wins, field by field. Everything that
//! interprets values (tag lists, timestamps, privacy) happens afterwards in
//! [`PartialMetadata::validate`], so both sources get identical treatment.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_CATEGORY_ID: &str = "22";
pub const MAX_TITLE_CHARS: usize = 100;
pub const MAX_DESCRIPTION_BYTES: usize = 5000;

/// Naive layouts accepted for `publish_at`; interpreted in local time.
const NAIVE_PUBLISH_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    #[default]
    Unlisted,
    Private,
}

impl FromStr for Privacy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "unlisted" => Ok(Self::Unlisted),
            "private" => Ok(Self::Private),
            other => Err(Error::validation(format!(
                "privacy must be one of public, unlisted, private (got {other:?})"
            ))),
        }
    }
}

impl fmt::Display for Privacy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Public => "public",
            Self::Unlisted => "unlisted",
            Self::Private => "private",
        })
    }
}

/// A plain value from a metadata file. YAML and TOML happily type `22` as an
/// integer, so fields that are strings for the API accept any scalar.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Tags as supplied: either one string (comma separated or a JSON array
/// literal) or an actual list from a structured file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TagsInput {
    List(Vec<Scalar>),
    Text(String),
}

impl TagsInput {
    pub fn normalize(&self) -> Vec<String> {
        match self {
            Self::List(items) => dedupe(items.iter().map(|item| item.to_string())),
            Self::Text(text) => parse_tags(text),
        }
    }
}

/// Parses `--tags` style input. A JSON array literal is taken as a list,
/// anything else is split on commas.
pub fn parse_tags(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[')
        && let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed)
    {
        return dedupe(items.into_iter().map(|item| match item {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        }));
    }
    dedupe(trimmed.split(',').map(str::to_string))
}

/// Trims, drops empties and duplicates, keeps first-seen order.
fn dedupe<I>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let tag = item.trim();
        if !tag.is_empty() && !out.iter().any(|seen| seen == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

/// Parses `publish_at` with naive timestamps read as local time.
pub fn parse_publish_at(input: &str) -> Result<DateTime<Utc>> {
    parse_publish_at_in(input, &Local)
}

/// Parses `publish_at`, reading naive timestamps in `tz`.
pub fn parse_publish_at_in<Tz: TimeZone>(input: &str, tz: &Tz) -> Result<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // RFC 3339 without seconds, e.g. 2025-01-31T14:30Z
    let with_offset = s
        .strip_suffix('Z')
        .map(|head| format!("{head}+00:00"))
        .unwrap_or_else(|| s.to_string());
    if let Ok(dt) = DateTime::parse_from_str(&with_offset, "%Y-%m-%dT%H:%M%:z") {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in NAIVE_PUBLISH_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| {
                    Error::validation(format!("publish_at {s:?} does not exist in local time"))
                });
        }
    }
    Err(Error::validation(format!(
        "publish_at {s:?} is invalid; use 'YYYY-MM-DD HH:MM' (local), \
         'YYYY-MM-DDTHH:MM:SS' with a timezone, or RFC 3339 '...Z'"
    )))
}

/// Renders an instant the way the platform expects `publishAt`.
pub fn format_publish_at(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One source's view of the metadata. Every field is optional; key names
/// mirror the command-line flags.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PartialMetadata {
    pub file: Option<PathBuf>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<TagsInput>,
    #[serde(alias = "category-id")]
    pub category_id: Option<Scalar>,
    pub privacy: Option<String>,
    pub thumbnail: Option<PathBuf>,
    #[serde(alias = "playlist-id")]
    pub playlist_id: Option<String>,
    #[serde(alias = "publish-at")]
    pub publish_at: Option<String>,
    #[serde(alias = "made-for-kids")]
    pub made_for_kids: Option<bool>,
}

impl PartialMetadata {
    /// Combines the command-line record with the metadata-file record. For
    /// every field the file value wins when both are present.
    pub fn merge(cli: PartialMetadata, file: PartialMetadata) -> PartialMetadata {
        PartialMetadata {
            file: file.file.or(cli.file),
            title: file.title.or(cli.title),
            description: file.description.or(cli.description),
            tags: file.tags.or(cli.tags),
            category_id: file.category_id.or(cli.category_id),
            privacy: file.privacy.or(cli.privacy),
            thumbnail: file.thumbnail.or(cli.thumbnail),
            playlist_id: file.playlist_id.or(cli.playlist_id),
            publish_at: file.publish_at.or(cli.publish_at),
            made_for_kids: file.made_for_kids.or(cli.made_for_kids),
        }
    }

    /// Validates with naive publish times read as local time.
    pub fn validate(self) -> Result<VideoMetadata> {
        self.validate_in(&Local)
    }

    /// Applies defaults, checks every field, and produces the canonical
    /// record. A scheduled publish time forces the video to private.
    pub fn validate_in<Tz: TimeZone>(self, tz: &Tz) -> Result<VideoMetadata> {
        let file = self
            .file
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or_else(|| {
                Error::validation("missing required --file (or `file` in the metadata file)")
            })?;

        let title = self
            .title
            .filter(|title| !title.trim().is_empty())
            .ok_or_else(|| {
                Error::validation("missing required --title (or `title` in the metadata file)")
            })?;
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(Error::validation(format!(
                "title is longer than {MAX_TITLE_CHARS} characters"
            )));
        }
        if title.contains(['<', '>']) {
            return Err(Error::validation("title must not contain '<' or '>'"));
        }

        let description = self.description.unwrap_or_default();
        if description.len() > MAX_DESCRIPTION_BYTES {
            return Err(Error::validation(format!(
                "description is longer than {MAX_DESCRIPTION_BYTES} bytes"
            )));
        }

        let tags = self.tags.map(|t| t.normalize()).unwrap_or_default();

        let category_id = match self.category_id {
            Some(raw) => {
                let code = raw.to_string().trim().to_string();
                if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
                    return Err(Error::validation(format!(
                        "category_id must be a numeric code (got {code:?})"
                    )));
                }
                code
            }
            None => DEFAULT_CATEGORY_ID.to_string(),
        };

        let mut privacy = match self.privacy.as_deref() {
            Some(raw) => raw.parse()?,
            None => Privacy::default(),
        };

        let publish_at = self
            .publish_at
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| parse_publish_at_in(raw, tz))
            .transpose()?;
        if let Some(at) = publish_at {
            if privacy != Privacy::Private {
                warn!("scheduled publishing requires private videos; overriding privacy {privacy} -> private");
                privacy = Privacy::Private;
            }
            if at <= Utc::now() {
                warn!("publish_at {} is in the past", format_publish_at(&at));
            }
        }

        Ok(VideoMetadata {
            file,
            title,
            description,
            tags,
            category_id,
            privacy,
            publish_at,
            made_for_kids: self.made_for_kids.unwrap_or(false),
            thumbnail: self.thumbnail.filter(|p| !p.as_os_str().is_empty()),
            playlist_id: self.playlist_id.filter(|id| !id.trim().is_empty()),
        })
    }
}

/// The canonical, validated set of upload parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub file: PathBuf,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy: Privacy,
    pub publish_at: Option<DateTime<Utc>>,
    pub made_for_kids: bool,
    pub thumbnail: Option<PathBuf>,
    pub playlist_id: Option<String>,
}

impl VideoMetadata {
    /// The video must exist before we spend a consent prompt or quota on it.
    pub fn ensure_video_exists(&self) -> Result<()> {
        if self.file.is_file() {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "video file not found: {}",
                self.file.display()
            )))
        }
    }
}

/// Reads a metadata file. `.json` and `.toml` are parsed as such; anything
/// else is treated as YAML.
pub fn load_metadata_file(path: &Path) -> Result<PartialMetadata> {
    let content = fs::read_to_string(path).map_err(|err| {
        Error::validation(format!("reading metadata file {}: {err}", path.display()))
    })?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    parse_metadata(&content, extension.as_deref())
        .map_err(|msg| Error::validation(format!("parsing {}: {msg}", path.display())))
}

fn parse_metadata(content: &str, extension: Option<&str>) -> std::result::Result<PartialMetadata, String> {
    if content.trim().is_empty() {
        return Ok(PartialMetadata::default());
    }
    match extension {
        Some("json") => serde_json::from_str(content).map_err(|err| err.to_string()),
        Some("toml") => toml::from_str(content).map_err(|err| err.to_string()),
        _ => {
            let value: serde_yaml::Value =
                serde_yaml::from_str(content).map_err(|err| err.to_string())?;
            if value.is_null() {
                return Ok(PartialMetadata::default());
            }
            serde_yaml::from_value(value).map_err(|err| err.to_string())
        }
    }
}
