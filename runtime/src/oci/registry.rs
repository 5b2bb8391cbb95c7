//! Registry client for pulling VM images.
//!
//! Speaks the OCI distribution protocol directly over `reqwest`:
//! manifest negotiation, bearer-token challenges, ranged blob downloads and
//! bounded retries of transient failures.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use rand::Rng;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RANGE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use vmpull_core::config::RetryConfig;
use vmpull_core::error::{Result, VmError};

use super::auth::{AuthContext, BearerChallenge, Credentials, TokenResponse};
use super::digest::Digest;
use super::manifest::{
    media_types, Descriptor, ManifestDocument, Platform, ResolvedManifest, MAX_INDEX_DEPTH,
    MAX_MANIFEST_BYTES,
};
use super::reference::RemoteName;
use crate::cache::BlobWriter;

/// What the pull orchestrator needs from a registry.
#[async_trait]
pub trait RegistryApi: Send + Sync {
    /// Resolve a tag or digest to a concrete manifest for this host's platform.
    async fn fetch_manifest(&self, reference: &str) -> Result<ResolvedManifest>;

    /// Stream a blob into `writer`, continuing from `writer.offset()`.
    ///
    /// Does not commit; the caller verifies and commits.
    async fn fetch_blob_into(&self, descriptor: &Descriptor, writer: &mut BlobWriter) -> Result<()>;
}

/// Body of a blob response.
pub struct BlobStream {
    response: Response,
    resumed: bool,
    idle_timeout: Duration,
}

impl BlobStream {
    /// Whether the registry honoured the requested range.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Next body chunk, or `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match tokio::time::timeout(self.idle_timeout, self.response.chunk()).await {
            Err(_) => Err(VmError::TransientNetworkError(
                "timed out reading blob body".to_string(),
            )),
            Ok(Err(e)) => Err(transport_error(e)),
            Ok(Ok(chunk)) => Ok(chunk),
        }
    }
}

/// `{"errors":[{"code":..,"message":..}]}`
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: Option<String>,
}

/// Client for one repository on one registry.
///
/// The auth context is cached for the lifetime of the client.
pub struct Registry {
    host: String,
    repository: String,
    base_url: String,
    client: reqwest::Client,
    credentials: Credentials,
    auth: RwLock<AuthContext>,
    retry: RetryConfig,
}

impl Registry {
    /// Client for the repository `name` lives in.
    ///
    /// With `insecure` the registry is reached over plain HTTP.
    pub fn new(
        name: &RemoteName,
        credentials: Credentials,
        insecure: bool,
        retry: RetryConfig,
    ) -> Result<Self> {
        let scheme = if insecure {
            tracing::warn!(
                registry = %name.host(),
                "Insecure mode: talking to registry over plain HTTP"
            );
            "http"
        } else {
            "https"
        };

        let client = reqwest::Client::builder()
            .connect_timeout(retry.request_timeout())
            .user_agent(format!("vmpull/{}", vmpull_core::VERSION))
            .build()
            .map_err(|e| VmError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            host: name.host().to_string(),
            repository: name.repository(),
            base_url: format!("{}://{}", scheme, api_host(name.host())),
            client,
            auth: RwLock::new(AuthContext::from_credentials(&credentials)),
            credentials,
            retry,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Establish (and cache) an auth context for this repository.
    pub async fn authenticate(&self) -> Result<AuthContext> {
        let url = format!("{}/v2/", self.base_url);
        let url: &str = &url;
        self.retrying("ping", move || async move {
            let response = self.send_authorized(|| self.client.get(url)).await?;
            self.check_status(response).await?;
            Ok(())
        })
        .await?;
        Ok(self.auth.read().clone())
    }

    /// Open a blob download, optionally from byte `range_start`.
    pub async fn fetch_blob(&self, digest: &Digest, range_start: Option<u64>) -> Result<BlobStream> {
        let url = format!("{}/v2/{}/blobs/{}", self.base_url, self.repository, digest);
        let response = self
            .send_authorized(|| {
                let request = self.client.get(&url);
                match range_start {
                    Some(offset) if offset > 0 => request.header(RANGE, format!("bytes={}-", offset)),
                    _ => request,
                }
            })
            .await?;
        let response = self.check_status(response).await?;

        Ok(BlobStream {
            resumed: response.status() == StatusCode::PARTIAL_CONTENT,
            response,
            idle_timeout: self.retry.request_timeout(),
        })
    }

    async fn fetch_blob_attempt(&self, descriptor: &Descriptor, writer: &mut BlobWriter) -> Result<()> {
        if writer.offset() > descriptor.size {
            writer.reset().await?;
        } else if writer.offset() == descriptor.size && descriptor.size > 0 {
            // Fully staged by an earlier attempt
            return Ok(());
        }

        let start = (writer.offset() > 0).then(|| writer.offset());
        let mut stream = match self.fetch_blob(&descriptor.digest, start).await {
            Err(VmError::RegistryError { status: 416, .. }) => {
                writer.reset().await?;
                return Err(VmError::TransientNetworkError(format!(
                    "registry rejected resume range for {}",
                    descriptor.digest
                )));
            }
            other => other?,
        };

        if start.is_some() && !stream.is_resumed() {
            tracing::debug!(digest = %descriptor.digest, "Range ignored, restarting blob");
            writer.reset().await?;
        }

        while let Some(chunk) = stream.next_chunk().await? {
            writer.write(&chunk).await?;
            if writer.offset() > descriptor.size {
                return Err(VmError::DigestMismatchError {
                    expected: descriptor.digest.to_string(),
                    actual: format!("more than the declared {} bytes", descriptor.size),
                });
            }
        }
        Ok(())
    }

    async fn fetch_manifest_once(&self, reference: &str) -> Result<(Option<String>, Bytes)> {
        let url = format!("{}/v2/{}/manifests/{}", self.base_url, self.repository, reference);
        let response = self
            .send_authorized(|| {
                self.client
                    .get(&url)
                    .header(ACCEPT, media_types::accept_header())
            })
            .await?;
        let mut response = self.check_status(response).await?;

        if response.content_length().unwrap_or(0) > MAX_MANIFEST_BYTES as u64 {
            return Err(VmError::ManifestError(format!(
                "manifest for {} exceeds {} bytes",
                reference, MAX_MANIFEST_BYTES
            )));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let mut body = Vec::new();
        loop {
            let chunk = tokio::time::timeout(self.retry.request_timeout(), response.chunk())
                .await
                .map_err(|_| {
                    VmError::TransientNetworkError("timed out reading manifest".to_string())
                })?
                .map_err(transport_error)?;
            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > MAX_MANIFEST_BYTES {
                return Err(VmError::ManifestError(format!(
                    "manifest for {} exceeds {} bytes",
                    reference, MAX_MANIFEST_BYTES
                )));
            }
            body.extend_from_slice(&chunk);
        }

        Ok((content_type, Bytes::from(body)))
    }

    /// Send a request, answering one authentication challenge if needed.
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let auth = self.current_auth().await?;
        let response = self.execute(auth.attach(build())).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse);

        let refreshed = match challenge {
            Some(challenge) => self.request_token(challenge).await?,
            None => match (&self.credentials, &auth) {
                (Credentials::Basic { .. }, AuthContext::Basic { .. }) | (Credentials::Anonymous, _) => {
                    return Err(self.auth_error("registry rejected the request".to_string()));
                }
                _ => AuthContext::from_credentials(&self.credentials),
            },
        };
        *self.auth.write() = refreshed.clone();

        let response = self.execute(refreshed.attach(build())).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.auth_error(format!(
                "credentials rejected after {} authentication",
                refreshed.scheme()
            )));
        }
        Ok(response)
    }

    /// Cached auth context, refreshed first if its token expired.
    async fn current_auth(&self) -> Result<AuthContext> {
        let auth = self.auth.read().clone();
        if !auth.is_expired() {
            return Ok(auth);
        }
        let Some(challenge) = auth.challenge().cloned() else {
            return Ok(auth);
        };
        tracing::debug!(registry = %self.host, "Bearer token expired, refreshing");
        let refreshed = self.request_token(challenge).await?;
        *self.auth.write() = refreshed.clone();
        Ok(refreshed)
    }

    /// Exchange credentials for a bearer token at the challenge's realm.
    async fn request_token(&self, challenge: BearerChallenge) -> Result<AuthContext> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));
        let mut request = self
            .client
            .get(&challenge.realm)
            .query(&[("scope", scope.as_str())]);
        if let Some(service) = challenge.service.as_deref() {
            request = request.query(&[("service", service)]);
        }
        if let Credentials::Basic { username, password } = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        tracing::debug!(realm = %challenge.realm, scope = %scope, "Requesting registry token");
        let response = self.execute(request).await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(self.auth_error(format!("token endpoint returned {}", status)));
        }
        let response = self.check_status(response).await?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.auth_error(format!("malformed token response: {}", e)))?;
        body.into_context(challenge)
            .ok_or_else(|| self.auth_error("token endpoint returned no token".to_string()))
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        tokio::time::timeout(self.retry.request_timeout(), request.send())
            .await
            .map_err(|_| {
                VmError::TransientNetworkError(format!("request to {} timed out", self.host))
            })?
            .map_err(transport_error)
    }

    /// Turn a non-success response into the matching error.
    async fn check_status(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|body| body.errors.into_iter().next())
            .map(|e| match e.message {
                Some(message) => format!("{}: {}", e.code, message),
                None => e.code,
            })
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string()
            });
        Err(classify_status(&self.host, status, message))
    }

    fn auth_error(&self, message: String) -> VmError {
        VmError::AuthenticationError {
            registry: self.host.clone(),
            message,
        }
    }

    /// Exponential backoff with up to 25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.backoff_for(attempt);
        let spread = base.as_millis() as u64 / 4;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        base + Duration::from_millis(jitter)
    }

    /// Run `op`, retrying transient failures.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        registry = %self.host,
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying registry request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[async_trait]
impl RegistryApi for Registry {
    async fn fetch_manifest(&self, reference: &str) -> Result<ResolvedManifest> {
        let mut reference = reference.to_string();
        let mut root_digest: Option<Digest> = None;

        for depth in 0..=MAX_INDEX_DEPTH {
            let current: &str = &reference;
            let (content_type, bytes) = self
                .retrying("manifest", move || self.fetch_manifest_once(current))
                .await?;

            let digest = Digest::of_bytes(&bytes);
            if current.starts_with("sha256:") && digest.as_str() != current {
                return Err(VmError::DigestMismatchError {
                    expected: current.to_string(),
                    actual: digest.to_string(),
                });
            }
            let root_digest = root_digest.get_or_insert_with(|| digest.clone()).clone();

            match ManifestDocument::parse(content_type.as_deref(), &bytes)? {
                ManifestDocument::Concrete(manifest) => {
                    let media_type = manifest
                        .media_type
                        .clone()
                        .unwrap_or_else(|| media_types::OCI_MANIFEST.to_string());
                    tracing::info!(
                        registry = %self.host,
                        repository = %self.repository,
                        digest = %digest,
                        layers = manifest.layers.len(),
                        "Resolved manifest"
                    );
                    return Ok(ResolvedManifest {
                        digest,
                        root_digest,
                        media_type,
                        bytes,
                        manifest,
                    });
                }
                ManifestDocument::Index(index) => {
                    let entry = index.select(&Platform::host())?;
                    tracing::debug!(
                        depth,
                        index = %digest,
                        selected = %entry.digest,
                        "Resolved image index entry"
                    );
                    reference = entry.digest.to_string();
                }
            }
        }

        Err(VmError::ManifestError(format!(
            "image index nesting deeper than {}",
            MAX_INDEX_DEPTH
        )))
    }

    async fn fetch_blob_into(&self, descriptor: &Descriptor, writer: &mut BlobWriter) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.fetch_blob_attempt(descriptor, writer).await {
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        digest = %descriptor.digest,
                        attempt,
                        offset = writer.offset(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying blob download"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// HTTP status → error class. Only 429 and 5xx are worth retrying.
pub(crate) fn classify_status(registry: &str, status: StatusCode, message: String) -> VmError {
    match status.as_u16() {
        401 | 403 => VmError::AuthenticationError {
            registry: registry.to_string(),
            message,
        },
        429 | 500..=599 => {
            VmError::TransientNetworkError(format!("{} returned {}: {}", registry, status, message))
        }
        code => VmError::RegistryError {
            registry: registry.to_string(),
            status: code,
            message,
        },
    }
}

fn transport_error(err: reqwest::Error) -> VmError {
    if err.is_builder() {
        VmError::ConfigError(format!("invalid registry request: {}", err))
    } else {
        VmError::TransientNetworkError(err.to_string())
    }
}

/// Docker Hub serves its API from a different host than its name.
fn api_host(host: &str) -> &str {
    if host == super::reference::DEFAULT_REGISTRY {
        "registry-1.docker.io"
    } else {
        host
    }
}
