//! HTTP transport for SOAP envelopes.
//!
//! [`WsmanSender`] is the seam between protocol logic and the network:
//! the clients in this crate post envelopes through it and tests swap in
//! scripted doubles. [`HttpSender`] is the production implementation on
//! top of `reqwest`, and is where host health bookkeeping happens: it
//! consults the [`HostRegistry`] before every request and records
//! authentication rejections and timeouts as they occur.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::{Auth, ConnectionInfo};
use crate::error::{WinRmError, WinRmResult};
use crate::parser::parse_fault;
use crate::registry::HostRegistry;

// ============================================================================
// Response Type
// ============================================================================

/// One SOAP response: HTTP status plus the body, kept as the chunks it
/// arrived in so streaming parsers can consume it incrementally.
#[derive(Debug, Clone)]
pub struct SoapReply {
    status: u16,
    chunks: Vec<Bytes>,
}

impl SoapReply {
    /// Assemble a reply from already-collected chunks.
    pub fn new(status: u16, chunks: Vec<Bytes>) -> Self {
        Self { status, chunks }
    }

    /// Assemble a single-chunk reply. Convenient for scripted senders.
    pub fn from_body(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            chunks: vec![body.into()],
        }
    }

    /// HTTP status code of the response.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Body chunks in arrival order.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Concatenated body, with invalid UTF-8 replaced.
    pub fn body_string(&self) -> String {
        let total: usize = self.chunks.iter().map(Bytes::len).sum();
        let mut joined = Vec::with_capacity(total);
        for chunk in &self.chunks {
            joined.extend_from_slice(chunk);
        }
        String::from_utf8_lossy(&joined).into_owned()
    }
}

// ============================================================================
// Sender Trait
// ============================================================================

/// Sends SOAP envelopes to a WS-Management endpoint.
#[async_trait]
pub trait WsmanSender: Send + Sync {
    /// Post one envelope and return the successful response.
    ///
    /// Non-success answers are classified before they reach the caller:
    /// HTTP 401 becomes [`WinRmError::Unauthorized`], a fault body with
    /// the missing-shell signature becomes [`WinRmError::ShellInvalidated`],
    /// and everything else a [`WinRmError::RequestError`] carrying the
    /// fault text and code.
    async fn send(&self, envelope: &str) -> WinRmResult<SoapReply>;
}

// ============================================================================
// HTTP Implementation
// ============================================================================

/// `reqwest`-backed sender for one WS-Management endpoint.
pub struct HttpSender {
    client: Client,
    info: ConnectionInfo,
    registry: Arc<HostRegistry>,
}

impl HttpSender {
    /// Build a sender for the given target. Validates the connection info
    /// and constructs the HTTP client with its timeout and TLS settings.
    pub fn new(info: ConnectionInfo, registry: Arc<HostRegistry>) -> WinRmResult<Self> {
        info.validate()?;

        let mut builder = Client::builder()
            .timeout(info.request_timeout())
            .danger_accept_invalid_certs(!info.verify_ssl());
        if !info.keep_alive() {
            // A pool size of zero closes the connection after each request.
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder.build().map_err(|e| {
            WinRmError::ConnectionFailed(format!("failed to build HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            info,
            registry,
        })
    }

    /// Connection parameters this sender was built from.
    pub fn connection(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Registry this sender records host health in.
    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    fn classify_transport_error(&self, e: reqwest::Error) -> WinRmError {
        let host = self.info.hostname();
        if e.is_timeout() {
            let after = self.info.request_timeout();
            self.registry.block_timeout(host, after);
            warn!(host = %host, after = ?after, "Request timed out; host blocked");
            WinRmError::Timeout {
                host: host.to_string(),
                after,
            }
        } else if e.is_connect() {
            WinRmError::ConnectionFailed(format!("{host}: {e}"))
        } else {
            WinRmError::ConnectionFailed(e.to_string())
        }
    }

    async fn collect_chunks(&self, response: reqwest::Response) -> WinRmResult<Vec<Bytes>> {
        let mut stream = response.bytes_stream();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.map_err(|e| self.classify_transport_error(e))?);
        }
        Ok(chunks)
    }

    fn error_from_body(&self, status: StatusCode, body: &str) -> WinRmError {
        if let Some(fault) = parse_fault(body) {
            if fault.is_shell_not_found() {
                return WinRmError::ShellInvalidated(fault.to_string());
            }
            return WinRmError::RequestError {
                status: status.as_u16(),
                reason: fault.to_string(),
                code: fault.code,
            };
        }
        let reason = if body.trim().is_empty() {
            "empty response body".to_string()
        } else {
            body.chars().take(200).collect()
        };
        WinRmError::RequestError {
            status: status.as_u16(),
            reason,
            code: None,
        }
    }
}

#[async_trait]
impl WsmanSender for HttpSender {
    async fn send(&self, envelope: &str) -> WinRmResult<SoapReply> {
        let host = self.info.hostname();
        self.registry.check_host(host)?;

        let url = self.info.endpoint_url();
        trace!(host = %host, bytes = envelope.len(), "Posting SOAP envelope");

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope.to_string());

        request = match self.info.auth() {
            Auth::Basic { username, .. } => {
                request.basic_auth(username, self.info.auth().basic_password())
            }
            Auth::Kerberos { .. } => {
                let source = self.info.token_source().ok_or_else(|| {
                    WinRmError::InvalidParameter(
                        "Kerberos authentication requires a token source".to_string(),
                    )
                })?;
                let token = source.token(&self.info.service_principal())?;
                request.header("Authorization", format!("Negotiate {token}"))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| self.classify_transport_error(e))?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            self.registry.block_unauthorized(host);
            warn!(host = %host, "Authentication rejected; host blocked");
            return Err(WinRmError::Unauthorized {
                host: host.to_string(),
            });
        }

        let chunks = self.collect_chunks(response).await?;

        if !status.is_success() {
            let reply = SoapReply::new(status.as_u16(), chunks);
            return Err(self.error_from_body(status, &reply.body_string()));
        }

        debug!(
            host = %host,
            status = status.as_u16(),
            chunks = chunks.len(),
            "SOAP response received"
        );
        Ok(SoapReply::new(status.as_u16(), chunks))
    }
}
