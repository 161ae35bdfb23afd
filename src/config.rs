//! Locating and loading the uploader's on-disk configuration.
//!
//! Two files matter: the OAuth client configuration downloaded from the
//! developer console, and the token store the credential manager writes.
//! Both paths follow the same lookup order: explicit flag, then environment
//! variable, then a fixed filename in the working directory.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_CLIENT_SECRETS_FILE: &str = "client_secret.json";
pub const DEFAULT_TOKEN_FILE: &str = "token_youtube_upload.json";
pub const CLIENT_SECRETS_ENV: &str = "YT_CLIENT_SECRETS";
pub const TOKEN_FILE_ENV: &str = "YT_TOKEN_FILE";

pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_DEVICE_URI: &str = "https://oauth2.googleapis.com/device/code";

/// Where the process should read and write its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub client_secrets: PathBuf,
    pub token_file: PathBuf,
}

/// Resolves both paths. `env` is injected so callers (and tests) decide
/// what the environment looks like.
pub fn resolve_paths<F>(
    client_secrets: Option<PathBuf>,
    token_file: Option<PathBuf>,
    env: F,
) -> RuntimePaths
where
    F: Fn(&str) -> Option<String>,
{
    RuntimePaths {
        client_secrets: resolve_path(
            client_secrets,
            CLIENT_SECRETS_ENV,
            DEFAULT_CLIENT_SECRETS_FILE,
            &env,
        ),
        token_file: resolve_path(token_file, TOKEN_FILE_ENV, DEFAULT_TOKEN_FILE, &env),
    }
}

/// Same as [`resolve_paths`] with the real process environment.
pub fn resolve_paths_from_env(
    client_secrets: Option<PathBuf>,
    token_file: Option<PathBuf>,
) -> RuntimePaths {
    resolve_paths(client_secrets, token_file, |key| std::env::var(key).ok())
}

fn resolve_path<F>(explicit: Option<PathBuf>, env_key: &str, default: &str, env: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    explicit
        .or_else(|| {
            env(env_key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(default))
}

/// Identity of this application towards the authorization server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_uri: String,
    pub token_uri: String,
    pub device_uri: String,
}

/// Layout of the console download: the credentials sit under either an
/// `installed` (desktop app) or a `web` key.
#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecretsEntry>,
    web: Option<ClientSecretsEntry>,
}

#[derive(Deserialize)]
struct ClientSecretsEntry {
    client_id: Option<String>,
    client_secret: Option<String>,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

pub fn load_client_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        return Err(Error::configuration(format!(
            "missing OAuth client configuration at {}; download the client JSON from the \
             Google Cloud Console (YouTube Data API v3 enabled) and pass --client-secrets \
             or set {CLIENT_SECRETS_ENV}",
            path.display()
        )));
    }
    let content = fs::read_to_string(path).map_err(|err| {
        Error::configuration(format!("reading {}: {err}", path.display()))
    })?;
    parse_client_config(&content)
        .map_err(|msg| Error::configuration(format!("{}: {msg}", path.display())))
}

fn parse_client_config(content: &str) -> std::result::Result<ClientConfig, String> {
    let file: ClientSecretsFile =
        serde_json::from_str(content).map_err(|err| format!("not valid client JSON: {err}"))?;
    let entry = file
        .installed
        .or(file.web)
        .ok_or_else(|| "expected an \"installed\" or \"web\" section".to_string())?;
    let client_id = entry
        .client_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| "client_id not set".to_string())?;
    Ok(ClientConfig {
        client_id,
        client_secret: entry.client_secret.filter(|s| !s.is_empty()),
        auth_uri: required_uri(entry.auth_uri, "auth_uri")?,
        token_uri: required_uri(entry.token_uri, "token_uri")?,
        device_uri: DEFAULT_DEVICE_URI.to_string(),
    })
}

fn required_uri(value: Option<String>, field: &str) -> std::result::Result<String, String> {
    value
        .map(|uri| uri.trim().to_string())
        .filter(|uri| !uri.is_empty())
        .ok_or_else(|| format!("{field} not set"))
}
