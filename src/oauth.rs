//! OAuth 2.0 plumbing: talking to the token endpoint, getting the user's
//! consent once, and the credential manager that decides which of the two a
//! run needs.
//!
//! The manager only depends on two small traits, [`TokenEndpoint`] and
//! [`ConsentFlow`]. The real implementations hit the network and block on
//! the user; tests swap in doubles that return canned grants.

use std::{
    cell::Cell,
    io::{BufRead, BufReader, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration as StdDuration, Instant},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    config::ClientConfig,
    error::{Error, Result},
    token::{StoredToken, TokenState, TokenStore, device_scopes},
};

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";
const HTTP_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Token response from the authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Grant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl Grant {
    /// Converts the response into what we persist. Refresh responses usually
    /// omit the refresh token, in which case the previous one is kept.
    pub fn into_stored(
        self,
        previous_refresh: Option<String>,
        requested: &[&str],
        now: DateTime<Utc>,
    ) -> StoredToken {
        let scopes = match self.scope.as_deref() {
            Some(scope) if !scope.trim().is_empty() => {
                scope.split_whitespace().map(str::to_string).collect()
            }
            _ => requested.iter().map(|s| s.to_string()).collect(),
        };
        StoredToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: self.expires_in.map(|secs| now + Duration::seconds(secs)),
            scopes,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
        }
    }
}

/// Exchanges a refresh token for a fresh access token.
pub trait TokenEndpoint {
    fn refresh(&self, refresh_token: &str) -> Result<Grant>;
}

/// Obtains a brand new grant by asking the user.
pub trait ConsentFlow {
    fn obtain(&self, scopes: &[&str]) -> Result<Grant>;
}

/// Error body of the token endpoint (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

enum TokenRequestError {
    OAuth {
        error: String,
        description: Option<String>,
    },
    Transport(String),
}

impl TokenRequestError {
    fn into_error(self, what: &str) -> Error {
        match self {
            Self::OAuth { error, description } => Error::authorization(match description {
                Some(description) => format!("{what}: {error} ({description})"),
                None => format!("{what}: {error}"),
            }),
            Self::Transport(msg) => Error::authorization(format!("{what}: {msg}")),
        }
    }
}

/// The authorization server of the OAuth client configuration.
#[derive(Debug, Clone)]
pub struct OAuthEndpoint {
    agent: ureq::Agent,
    client: ClientConfig,
}

impl OAuthEndpoint {
    pub fn new(client: ClientConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
        Self { agent, client }
    }

    pub fn client(&self) -> &ClientConfig {
        &self.client
    }

    fn with_client_credentials<'a>(&'a self, form: &mut Vec<(&'a str, &'a str)>) {
        form.push(("client_id", self.client.client_id.as_str()));
        if let Some(secret) = self.client.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
    }

    fn post_form<T>(&self, url: &str, form: &[(&str, &str)]) -> std::result::Result<T, TokenRequestError>
    where
        T: DeserializeOwned,
    {
        match self.agent.post(url).send_form(form) {
            Ok(resp) => resp
                .into_json()
                .map_err(|err| TokenRequestError::Transport(format!("decoding response: {err}"))),
            Err(ureq::Error::Status(code, resp)) => {
                match resp.into_json::<OAuthErrorBody>() {
                    Ok(body) => Err(TokenRequestError::OAuth {
                        error: body.error,
                        description: body.error_description,
                    }),
                    Err(_) => Err(TokenRequestError::OAuth {
                        error: format!("HTTP {code}"),
                        description: None,
                    }),
                }
            }
            Err(err) => Err(TokenRequestError::Transport(err.to_string())),
        }
    }

    pub fn exchange_code(&self, code: &str, verifier: &str, redirect_uri: &str) -> Result<Grant> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("code_verifier", verifier),
            ("redirect_uri", redirect_uri),
        ];
        self.with_client_credentials(&mut form);
        self.post_form(&self.client.token_uri, &form)
            .map_err(|err| err.into_error("exchanging authorization code"))
    }

    fn request_device_code(&self, scopes: &[&str]) -> Result<DeviceCode> {
        let scope = scopes.join(" ");
        let form = [
            ("client_id", self.client.client_id.as_str()),
            ("scope", scope.as_str()),
        ];
        self.post_form(&self.client.device_uri, &form)
            .map_err(|err| err.into_error("requesting device code"))
    }

    fn poll_device_token(&self, device_code: &str) -> std::result::Result<Grant, TokenRequestError> {
        let mut form = vec![("grant_type", DEVICE_GRANT_TYPE), ("device_code", device_code)];
        self.with_client_credentials(&mut form);
        self.post_form(&self.client.token_uri, &form)
    }
}

impl TokenEndpoint for OAuthEndpoint {
    fn refresh(&self, refresh_token: &str) -> Result<Grant> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.with_client_credentials(&mut form);
        self.post_form(&self.client.token_uri, &form)
            .map_err(|err| err.into_error("refreshing access token"))
    }
}

/// PKCE verifier/challenge pair (RFC 7636, S256).
#[derive(Debug, Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        Self::from_verifier(random_token(32))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Builds the consent URL the user's browser is sent to.
pub fn authorization_url(
    client: &ClientConfig,
    redirect_uri: &str,
    scopes: &[&str],
    state: &str,
    pkce: &Pkce,
) -> Result<Url> {
    let scope = scopes.join(" ");
    Url::parse_with_params(
        &client.auth_uri,
        &[
            ("response_type", "code"),
            ("client_id", client.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", state),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|err| Error::configuration(format!("invalid auth_uri {}: {err}", client.auth_uri)))
}

/// What the browser delivered to the loopback listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Code(String),
    Denied(String),
    /// Not the redirect we are waiting for (favicon, stray request).
    Ignored,
}

/// Interprets the request line of an HTTP request hitting the loopback
/// listener, e.g. `GET /?state=..&code=.. HTTP/1.1`.
pub fn parse_redirect(request_line: &str, expected_state: &str) -> Result<Redirect> {
    let Some(target) = request_line.split_whitespace().nth(1) else {
        return Ok(Redirect::Ignored);
    };
    let Ok(url) = Url::parse(&format!("http://localhost{target}")) else {
        return Ok(Redirect::Ignored);
    };
    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };
    let (code, error) = (param("code"), param("error"));
    if code.is_none() && error.is_none() {
        return Ok(Redirect::Ignored);
    }
    if param("state").as_deref() != Some(expected_state) {
        return Err(Error::authorization(
            "state mismatch in authorization redirect",
        ));
    }
    Ok(match (code, error) {
        (_, Some(error)) => Redirect::Denied(error),
        (Some(code), None) => Redirect::Code(code),
        (None, None) => Redirect::Ignored,
    })
}

#[derive(Debug, Deserialize)]
struct DeviceCode {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_uri")]
    verification_url: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

/// The real consent flow: browser with a loopback redirect, or the device
/// authorization grant when no browser can be opened.
pub struct InteractiveConsent<'a> {
    endpoint: &'a OAuthEndpoint,
    use_browser: bool,
}

impl<'a> InteractiveConsent<'a> {
    pub fn new(endpoint: &'a OAuthEndpoint, use_browser: bool) -> Self {
        Self {
            endpoint,
            use_browser,
        }
    }

    /// Returns `Ok(None)` when the browser could not be opened.
    fn browser_flow(&self, scopes: &[&str]) -> Result<Option<Grant>> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|err| Error::authorization(format!("binding loopback listener: {err}")))?;
        let port = listener
            .local_addr()
            .map_err(|err| Error::authorization(format!("reading loopback address: {err}")))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{port}/");
        let state = random_token(16);
        let pkce = Pkce::generate();
        let url = authorization_url(self.endpoint.client(), &redirect_uri, scopes, &state, &pkce)?;

        if let Err(err) = webbrowser::open(url.as_str()) {
            warn!("could not open a browser ({err}); falling back to device code flow");
            return Ok(None);
        }
        println!("If the browser did not open, visit this URL to authorize:\n{url}");
        info!("waiting for authorization on {redirect_uri}");

        let code = wait_for_code(&listener, &state)?;
        self.endpoint
            .exchange_code(&code, &pkce.verifier, &redirect_uri)
            .map(Some)
    }

    fn device_flow(&self, scopes: &[&str]) -> Result<Grant> {
        self.device_flow_with(scopes, thread::sleep)
    }

    /// Device authorization grant; `wait` blocks between two polls.
    fn device_flow_with<W>(&self, scopes: &[&str], mut wait: W) -> Result<Grant>
    where
        W: FnMut(StdDuration),
    {
        let device = self.endpoint.request_device_code(&device_scopes(scopes))?;
        println!(
            "To authorize this uploader, visit {} and enter the code: {}",
            device.verification_url, device.user_code
        );
        let deadline = Instant::now() + StdDuration::from_secs(device.expires_in);
        let mut interval = device.interval.max(1);
        loop {
            if Instant::now() >= deadline {
                return Err(Error::authorization("device code expired before consent"));
            }
            wait(StdDuration::from_secs(interval));
            match self.endpoint.poll_device_token(&device.device_code) {
                Ok(grant) => return Ok(grant),
                Err(TokenRequestError::OAuth { error, .. }) if error == "authorization_pending" => {
                    debug!("authorization pending");
                }
                Err(TokenRequestError::OAuth { error, .. }) if error == "slow_down" => {
                    interval += 5;
                    debug!("asked to slow down; polling every {interval}s");
                }
                Err(err) => return Err(err.into_error("device authorization")),
            }
        }
    }
}

impl ConsentFlow for InteractiveConsent<'_> {
    fn obtain(&self, scopes: &[&str]) -> Result<Grant> {
        if self.use_browser
            && let Some(grant) = self.browser_flow(scopes)?
        {
            return Ok(grant);
        }
        self.device_flow(scopes)
    }
}

fn wait_for_code(listener: &TcpListener, expected_state: &str) -> Result<String> {
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                debug!("loopback accept failed: {err}");
                continue;
            }
        };
        let mut request_line = String::new();
        if BufReader::new(&mut stream)
            .read_line(&mut request_line)
            .is_err()
        {
            continue;
        }
        match parse_redirect(&request_line, expected_state) {
            Ok(Redirect::Ignored) => respond(&mut stream, "404 Not Found", "Not found."),
            Ok(Redirect::Code(code)) => {
                respond(
                    &mut stream,
                    "200 OK",
                    "Authorization complete. You can close this tab.",
                );
                return Ok(code);
            }
            Ok(Redirect::Denied(reason)) => {
                respond(&mut stream, "200 OK", "Authorization was denied.");
                return Err(Error::authorization(format!("consent denied: {reason}")));
            }
            Err(err) => {
                respond(&mut stream, "400 Bad Request", "Authorization failed.");
                return Err(err);
            }
        }
    }
    Err(Error::authorization("loopback listener closed before consent"))
}

fn respond(stream: &mut TcpStream, status: &str, message: &str) {
    let body = format!("<html><body>{message}</body></html>");
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Consent flow that never prompts: hands out a fixed grant and counts how
/// often it was asked.
#[derive(Debug)]
pub struct StaticConsent {
    grant: Grant,
    prompts: Cell<usize>,
}

impl StaticConsent {
    pub fn new(grant: Grant) -> Self {
        Self {
            grant,
            prompts: Cell::new(0),
        }
    }

    pub fn prompts(&self) -> usize {
        self.prompts.get()
    }
}

impl ConsentFlow for StaticConsent {
    fn obtain(&self, _scopes: &[&str]) -> Result<Grant> {
        self.prompts.set(self.prompts.get() + 1);
        Ok(self.grant.clone())
    }
}

/// Loads, refreshes, or acquires the credential for one run.
///
/// ```text
/// NoToken ─────────────► AwaitingUserConsent ──► Valid (persisted)
/// Expired ─refresh ok──► Valid (persisted)
/// Expired ─refresh err─► AwaitingUserConsent
/// ```
pub struct CredentialManager<'a> {
    store: TokenStore,
    endpoint: &'a dyn TokenEndpoint,
    consent: &'a dyn ConsentFlow,
    scopes: &'a [&'a str],
}

impl<'a> CredentialManager<'a> {
    pub fn new(
        store: TokenStore,
        endpoint: &'a dyn TokenEndpoint,
        consent: &'a dyn ConsentFlow,
        scopes: &'a [&'a str],
    ) -> Self {
        Self {
            store,
            endpoint,
            consent,
            scopes,
        }
    }

    pub fn authorize(&self) -> Result<StoredToken> {
        self.authorize_at(Utc::now())
    }

    pub fn authorize_at(&self, now: DateTime<Utc>) -> Result<StoredToken> {
        match TokenState::classify(self.store.load()?, self.scopes, now) {
            TokenState::Valid(token) => {
                debug!("using stored token from {}", self.store.path().display());
                Ok(token)
            }
            TokenState::Expired(token) => match token.refresh_token {
                Some(refresh_token) => match self.endpoint.refresh(&refresh_token) {
                    Ok(grant) => {
                        info!("access token refreshed");
                        let token = grant.into_stored(Some(refresh_token), self.scopes, now);
                        self.store.save(&token)?;
                        Ok(token)
                    }
                    Err(err) => {
                        warn!("{err}; asking for consent again");
                        self.consent_at(now)
                    }
                },
                None => self.consent_at(now),
            },
            TokenState::NoToken => self.consent_at(now),
        }
    }

    fn consent_at(&self, now: DateTime<Utc>) -> Result<StoredToken> {
        let grant = self.consent.obtain(self.scopes)?;
        let token = grant.into_stored(None, self.scopes, now);
        self.store.save(&token)?;
        info!("authorization stored in {}", self.store.path().display());
        Ok(token)
    }
}
