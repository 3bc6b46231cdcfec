//! Localhost peer HTTP client.
//!
//! One `PeerClient` per service; every call carries an explicit deadline and
//! failures come back as values, not panics or exceptions. Handlers match on
//! `PeerError` and surface `peer_unavailable` / `timeout` / `rejected` to
//! their own callers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub mod xml;

/// Deadline for control commands between services.
pub const COMMAND_DEADLINE: Duration = Duration::from_secs(2);
/// Deadline for metadata fetches.
pub const METADATA_DEADLINE: Duration = Duration::from_secs(5);
/// Deadline for bulk loads (playlists, track lists).
pub const BULK_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for supervisor liveness probes.
pub const HEALTH_DEADLINE: Duration = Duration::from_secs(1);

/// Outcome of a peer call that did not produce a usable response.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Connection refused or reset; the peer is not listening.
    #[error("peer unavailable: {url}")]
    Unreachable { url: String },
    /// Deadline elapsed before a response arrived.
    #[error("peer timeout after {deadline:?}: {url}")]
    Timeout { url: String, deadline: Duration },
    /// The peer answered with a non-success status.
    #[error("peer rejected ({status}): {url}")]
    Rejected { url: String, status: u16, body: String },
    /// Malformed response body.
    #[error("peer protocol error: {0}")]
    Protocol(String),
}

impl PeerError {
    /// Short wire token for surfacing to callers.
    pub fn status_token(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "peer_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::Protocol(_) => "protocol_error",
        }
    }

    fn from_reqwest(url: &str, deadline: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
                deadline,
            }
        } else if err.is_connect() {
            Self::Unreachable {
                url: url.to_string(),
            }
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

/// HTTP client with injected deadlines for localhost peers and speaker
/// control endpoints.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
}

impl Default for PeerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerClient {
    pub fn new() -> Self {
        Self {
            // Per-call deadlines only; no client-wide timeout that could
            // silently shadow them.
            http: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// POST a JSON body, expect a JSON response within `deadline`.
    pub async fn post_json<B: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        deadline: Duration,
    ) -> Result<R, PeerError> {
        let response = self
            .http
            .post(url)
            .timeout(deadline)
            .json(body)
            .send()
            .await
            .map_err(|e| PeerError::from_reqwest(url, deadline, e))?;

        Self::decode(url, response).await
    }

    /// GET a JSON response within `deadline`.
    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        deadline: Duration,
    ) -> Result<R, PeerError> {
        let response = self
            .http
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| PeerError::from_reqwest(url, deadline, e))?;

        Self::decode(url, response).await
    }

    /// Liveness probe: GET, success status only, body ignored.
    pub async fn probe(&self, url: &str, deadline: Duration) -> Result<(), PeerError> {
        let response = self
            .http
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| PeerError::from_reqwest(url, deadline, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(PeerError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
                body: String::new(),
            })
        }
    }

    /// GET a plain text (or XML) body within `deadline`.
    pub async fn get_text(&self, url: &str, deadline: Duration) -> Result<String, PeerError> {
        let response = self
            .http
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| PeerError::from_reqwest(url, deadline, e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(text)
        } else {
            Err(PeerError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
                body: text,
            })
        }
    }

    /// POST a raw body with an explicit content type (speaker SOAP calls).
    pub async fn post_raw(
        &self,
        url: &str,
        content_type: &str,
        headers: &[(&str, &str)],
        body: String,
        deadline: Duration,
    ) -> Result<String, PeerError> {
        let mut request = self
            .http
            .post(url)
            .timeout(deadline)
            .header("Content-Type", content_type)
            .body(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PeerError::from_reqwest(url, deadline, e))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            Ok(text)
        } else {
            Err(PeerError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
                body: text,
            })
        }
    }

    async fn decode<R: DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<R, PeerError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PeerError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| PeerError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_peer_is_a_value_not_a_panic() {
        let client = PeerClient::new();
        // Port 1 on loopback: nothing listens there.
        let err = client
            .probe("http://127.0.0.1:1/health", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PeerError::Unreachable { .. } | PeerError::Timeout { .. }
        ));
        assert_ne!(err.status_token(), "rejected");
    }

    #[test]
    fn status_tokens() {
        let err = PeerError::Timeout {
            url: "http://127.0.0.1:1".into(),
            deadline: COMMAND_DEADLINE,
        };
        assert_eq!(err.status_token(), "timeout");

        let err = PeerError::Rejected {
            url: "x".into(),
            status: 405,
            body: String::new(),
        };
        assert_eq!(err.status_token(), "rejected");
    }
}
