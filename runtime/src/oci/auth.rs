//! Registry authentication schemes.
//!
//! Credentials come from a [`CredentialProvider`](super::credentials::CredentialProvider);
//! the registry client turns them into an [`AuthContext`] that is attached to
//! every request and refreshed when a bearer token expires.

use std::fmt;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

/// Token lifetime assumed when the token endpoint does not say.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60);

/// Credentials supplied by the user or a credential provider.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    /// Pre-issued bearer token
    Token(String),
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse a `WWW-Authenticate` header value.
    ///
    /// Returns `None` for non-bearer schemes or when no realm is given.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm.filter(|r| !r.is_empty())?,
            service,
            scope,
        })
    }
}

/// Split `k1="v1",k2=v2` honouring commas inside quotes.
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = params.chars().peekable();

    loop {
        // skip separators
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '"' => break,
                        _ => value.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }

    pairs
}

/// Token endpoint response. Registries use either `token` or `access_token`.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    pub(crate) fn into_context(self, challenge: BearerChallenge) -> Option<AuthContext> {
        let token = self.token.or(self.access_token).filter(|t| !t.is_empty())?;
        let ttl = self
            .expires_in
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_TTL);
        Some(AuthContext::Bearer {
            token,
            expires_at: Some(Instant::now() + ttl),
            challenge: Some(challenge),
        })
    }
}

/// Authentication attached to registry requests.
///
/// Selected once per registry client and cached for the session.
#[derive(Clone)]
pub enum AuthContext {
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
        /// `None` for static tokens
        expires_at: Option<Instant>,
        /// Challenge the token was issued for, reused on refresh
        challenge: Option<BearerChallenge>,
    },
}

impl AuthContext {
    /// Initial context before any challenge has been seen.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        match credentials {
            Credentials::Anonymous => AuthContext::Anonymous,
            Credentials::Basic { username, password } => AuthContext::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            Credentials::Token(token) => AuthContext::Bearer {
                token: token.clone(),
                expires_at: None,
                challenge: None,
            },
        }
    }

    /// Add the `Authorization` header for this scheme.
    pub fn attach(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            AuthContext::Anonymous => request,
            AuthContext::Basic { username, password } => {
                request.header(reqwest::header::AUTHORIZATION, basic_header(username, password))
            }
            AuthContext::Bearer { token, .. } => request.bearer_auth(token),
        }
    }

    /// Bearer token past (or within a second of) its expiry.
    pub fn is_expired(&self) -> bool {
        match self {
            AuthContext::Bearer {
                expires_at: Some(at),
                ..
            } => Instant::now() + Duration::from_secs(1) >= *at,
            _ => false,
        }
    }

    /// Challenge to replay when refreshing an expired token.
    pub fn challenge(&self) -> Option<&BearerChallenge> {
        match self {
            AuthContext::Bearer { challenge, .. } => challenge.as_ref(),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            AuthContext::Anonymous => "anonymous",
            AuthContext::Basic { .. } => "basic",
            AuthContext::Bearer { .. } => "bearer",
        }
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthContext({})", self.scheme())
    }
}

/// `Basic <base64(user:pass)>`
pub fn basic_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}
