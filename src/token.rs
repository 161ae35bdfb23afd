//! The persisted user credential and the file it lives in.
//!
//! The store is a single JSON file at an injected path. Writes go through a
//! temporary file in the same directory followed by a rename, so a crash in
//! the middle of a refresh never leaves a truncated token behind.
//! Concurrent runs against the same file are not supported.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const UPLOAD_SCOPE: &str = "https://www.googleapis.com/auth/youtube.upload";
pub const YOUTUBE_SCOPE: &str = "https://www.googleapis.com/auth/youtube";

/// Scopes requested for every grant: upload plus the general scope needed
/// for thumbnails and playlist edits.
pub const SCOPES: &[&str] = &[UPLOAD_SCOPE, YOUTUBE_SCOPE];

/// Scopes to ask for through the device authorization grant, which does not
/// offer the upload-only scope. The general scope is a superset of it.
pub fn device_scopes<'a>(scopes: &[&'a str]) -> Vec<&'a str> {
    let mut out: Vec<&'a str> = Vec::with_capacity(scopes.len());
    for &scope in scopes {
        let scope = if scope == UPLOAD_SCOPE { YOUTUBE_SCOPE } else { scope };
        if !out.contains(&scope) {
            out.push(scope);
        }
    }
    out
}

fn grants(granted: &str, required: &str) -> bool {
    granted == required || (granted == YOUTUBE_SCOPE && required == UPLOAD_SCOPE)
}

/// Tokens this close to expiry are refreshed up front.
const EXPIRY_SKEW_SECS: i64 = 60;

/// An access/refresh token pair as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - Duration::seconds(EXPIRY_SKEW_SECS) <= now,
            None => false,
        }
    }

    pub fn covers(&self, required: &[&str]) -> bool {
        required
            .iter()
            .all(|scope| self.scopes.iter().any(|granted| grants(granted, scope)))
    }
}

/// What the credential manager finds when it looks at the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenState {
    NoToken,
    Valid(StoredToken),
    Expired(StoredToken),
}

impl TokenState {
    /// Classifies a loaded token. Tokens missing a required scope count as
    /// absent since they cannot be used for this run anyway.
    pub fn classify(token: Option<StoredToken>, required: &[&str], now: DateTime<Utc>) -> Self {
        match token {
            None => Self::NoToken,
            Some(token) if !token.covers(required) => {
                debug!("stored token lacks required scopes; ignoring it");
                Self::NoToken
            }
            Some(token) if token.is_expired_at(now) => Self::Expired(token),
            Some(token) => Self::Valid(token),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `None` when nothing has been stored yet. A corrupt file is
    /// treated the same way so the next grant simply replaces it.
    pub fn load(&self) -> Result<Option<StoredToken>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|err| {
            Error::authorization(format!("reading token file {}: {err}", self.path.display()))
        })?;
        match serde_json::from_str(&content) {
            Ok(token) => Ok(Some(token)),
            Err(err) => {
                log::warn!(
                    "ignoring unreadable token file {}: {err}",
                    self.path.display()
                );
                Ok(None)
            }
        }
    }

    /// Atomically replaces the stored token.
    pub fn save(&self, token: &StoredToken) -> Result<()> {
        self.write_atomic(token).map_err(|err| {
            Error::authorization(format!(
                "writing token file {}: {err}",
                self.path.display()
            ))
        })?;
        debug!("token saved to {}", self.path.display());
        Ok(())
    }

    fn write_atomic(&self, token: &StoredToken) -> std::io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(token)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}
