//! Remote HTTPS Client (C6): shared transport used by the Proxmox VM backend (C5).
//!
//! Multi-host failover, bounded retries with a fixed exponential backoff schedule, chunked
//! body writes, and connection-reset tolerance. Single-threaded cooperative per invocation: a
//! request occupies the caller and does not return until success, retry budget exhaustion, or
//! a fatal error.

use crate::error::{BackendError, RuntimeError};
use derive_builder::Builder;
use getset::Getters;
use log::warn;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

/// Fixed exponential backoff schedule, capped at the last entry, per the retry policy.
const BACKOFF_SCHEDULE_MS: &[u64] = &[250, 500, 1000, 2000, 4000, 8000];
const MAX_ATTEMPTS: usize = 5;
const CHUNK_MIN: usize = 4 * 1024;
const CHUNK_MAX: usize = 16 * 1024;
const INTER_CHUNK_PAUSE: Duration = Duration::from_millis(5);

#[derive(Clone, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// A Proxmox-reachable node exposing a container/VM management API with token-based auth.
pub struct RemoteEndpoint {
    #[getset(get = "pub")]
    /// Non-empty ordered list of hosts; failover cycles through them round-robin.
    hosts: Vec<String>,

    #[getset(get = "pub")]
    #[builder(default = "8006")]
    port: u16,

    #[getset(get = "pub")]
    api_token: String,

    #[getset(get = "pub")]
    node_name: String,

    #[getset(get = "pub")]
    #[builder(default = "true")]
    tls_verify: bool,

    #[getset(get = "pub")]
    #[builder(default = "Duration::from_secs(30)")]
    timeout: Duration,
}

impl std::fmt::Debug for RemoteEndpoint {
    /// Manual impl: the derived one would print `api_token` verbatim into logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("hosts", &self.hosts)
            .field("port", &self.port)
            .field("api_token", &"<redacted>")
            .field("node_name", &self.node_name)
            .field("tls_verify", &self.tls_verify)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Maps an HTTP status code to a retriable/fatal classification, per the status table in the
/// transport design notes (a table edit rather than a branch in transport code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    Success,
    Retriable,
    Fatal(&'static str),
}

pub fn classify_status(status: StatusCode) -> StatusOutcome {
    match status.as_u16() {
        200 | 201 => StatusOutcome::Success,
        401 => StatusOutcome::Fatal("AuthError"),
        403 => StatusOutcome::Fatal("PermissionDenied"),
        404 => StatusOutcome::Fatal("NotFound"),
        408 => StatusOutcome::Retriable,
        500..=599 => StatusOutcome::Retriable,
        _ => StatusOutcome::Fatal("RemoteFailed"),
    }
}

#[derive(serde::Deserialize)]
struct Envelope<T> {
    data: T,
}

/// The shared HTTPS transport. One instance per invocation.
pub struct RemoteClient {
    endpoint: RemoteEndpoint,
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(endpoint: RemoteEndpoint) -> Result<Self, RuntimeError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!endpoint.tls_verify)
            .timeout(endpoint.timeout)
            .build()
            .map_err(|e| RuntimeError::Internal(anyhow::anyhow!(e)))?;
        Ok(Self { endpoint, http })
    }

    fn base_url(&self, host: &str) -> String {
        format!("https://{}:{}/api2/json", host, self.endpoint.port)
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}", self.endpoint.api_token)
    }

    /// Issues a request against `path`, retrying with failover per the policy in this module's
    /// docs. `form` is an optional `application/x-www-form-urlencoded` body (used for create
    /// and update calls); large bodies are chunked via [`Self::send_chunked`] instead.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<T, RuntimeError> {
        let mut last_err: Option<RuntimeError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            let host = &self.endpoint.hosts[attempt % self.endpoint.hosts.len()];
            let url = format!("{}{}", self.base_url(host), path);

            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", self.auth_header())
                .header("Accept", "application/json")
                .header("User-Agent", concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));

            if let Some(form) = form {
                req = req.form(form);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    match classify_status(status) {
                        StatusOutcome::Success => {
                            let envelope: Envelope<T> = resp
                                .json()
                                .await
                                .map_err(|e| RuntimeError::Internal(anyhow::anyhow!(e)))?;
                            return Ok(envelope.data);
                        }
                        StatusOutcome::Fatal("AuthError") => {
                            return Err(RuntimeError::Auth(format!("{host}: {status}")))
                        }
                        StatusOutcome::Fatal("PermissionDenied") => {
                            return Err(RuntimeError::PermissionDenied(format!("{host}: {status}")))
                        }
                        StatusOutcome::Fatal("NotFound") => {
                            return Err(RuntimeError::NotFound(format!("{host}: {status}")))
                        }
                        StatusOutcome::Fatal(_) => {
                            return Err(RuntimeError::Backend(BackendError::RemoteFailed(
                                format!("{host}: {status} (non-retriable)"),
                            )))
                        }
                        StatusOutcome::Retriable => {
                            last_err = Some(RuntimeError::Backend(BackendError::RemoteFailed(
                                format!("{host}: {status}"),
                            )));
                        }
                    }
                }
                Err(e) => {
                    last_err = Some(RuntimeError::Backend(BackendError::RemoteFailed(format!(
                        "{host}: {e}"
                    ))));
                }
            }

            warn!(
                "remote request attempt {} of {} failed, retrying",
                attempt + 1,
                MAX_ATTEMPTS
            );

            if attempt + 1 < MAX_ATTEMPTS {
                let idx = attempt.min(BACKOFF_SCHEDULE_MS.len() - 1);
                sleep(Duration::from_millis(BACKOFF_SCHEDULE_MS[idx])).await;
            }
        }

        Err(last_err.unwrap_or_else(|| {
            RuntimeError::Backend(BackendError::RemoteFailed("retry budget exhausted".into()))
        }))
    }

    /// Issues a multipart upload chunked into 4-16 KiB pieces with a brief inter-chunk pause,
    /// to mitigate upstream-reset behavior observed against TLS-terminating proxies. Bodies of
    /// 4 KiB or less are sent as a single chunk.
    pub async fn send_chunked(&self, path: &str, body: &[u8]) -> Result<Value, RuntimeError> {
        if body.len() <= CHUNK_MIN {
            return self.send_chunk(path, body).await;
        }

        let mut offset = 0;
        let mut last = Value::Null;
        while offset < body.len() {
            let chunk_len = CHUNK_MAX.min(body.len() - offset);
            let chunk = &body[offset..offset + chunk_len];
            last = self.send_chunk(path, chunk).await?;
            offset += chunk_len;
            if offset < body.len() {
                sleep(INTER_CHUNK_PAUSE).await;
            }
        }
        Ok(last)
    }

    async fn send_chunk(&self, path: &str, chunk: &[u8]) -> Result<Value, RuntimeError> {
        let host = &self.endpoint.hosts[0];
        let url = format!("{}{}", self.base_url(host), path);
        let part = reqwest::multipart::Part::bytes(chunk.to_vec()).file_name("chunk");
        let form = reqwest::multipart::Form::new().part("filename", part);

        let resp = self
            .http
            .post(&url)
            .header("Authorization", self.auth_header())
            .multipart(form)
            .send()
            .await
            .map_err(|e| RuntimeError::Backend(BackendError::RemoteFailed(e.to_string())))?;

        let envelope: Envelope<Value> = resp
            .json()
            .await
            .map_err(|e| RuntimeError::Internal(anyhow::anyhow!(e)))?;
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_policy() {
        assert_eq!(
            classify_status(StatusCode::OK),
            StatusOutcome::Success
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            StatusOutcome::Fatal("AuthError")
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            StatusOutcome::Fatal("PermissionDenied")
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            StatusOutcome::Fatal("NotFound")
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            StatusOutcome::Retriable
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            StatusOutcome::Retriable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            StatusOutcome::Fatal("RemoteFailed")
        );
    }

    #[test]
    fn backoff_schedule_matches_policy() {
        assert_eq!(BACKOFF_SCHEDULE_MS, &[250, 500, 1000, 2000, 4000, 8000]);
    }

    #[test]
    fn endpoint_builder_defaults() {
        let endpoint = RemoteEndpointBuilder::default()
            .hosts(vec!["a".to_string(), "b".to_string()])
            .api_token("id=secret")
            .node_name("pve")
            .build()
            .unwrap();
        assert_eq!(*endpoint.port(), 8006);
        assert!(*endpoint.tls_verify());
    }
}
