//! Connection configuration for WS-Management targets.
//!
//! A [`ConnectionInfo`] describes one remote host: endpoint address,
//! credentials, timeouts, and protocol tuning. Instances are immutable
//! once built; the `with_*` methods return modified copies, which is how
//! callers derive failover targets from a template without touching the
//! original.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{WinRmError, WinRmResult};

// ============================================================================
// Constants
// ============================================================================

/// Default WinRM HTTP port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Default WinRM HTTPS port
pub const DEFAULT_WINRM_SSL_PORT: u16 = 5986;

/// Default HTTP request timeout. Kept above the operation timeout: the
/// server holds a quiet Receive open for the full operation timeout, and
/// the client must not give up first.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(75);

/// Default server-side operation timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum SOAP envelope size in bytes
pub const DEFAULT_MAX_ENVELOPE_SIZE: u32 = 153600;

/// Default console code page (UTF-8)
pub const DEFAULT_CODEPAGE: u32 = 65001;

// ============================================================================
// Authentication Types
// ============================================================================

/// Credential material for a WS-Management target.
#[derive(Debug, Clone)]
pub enum Auth {
    /// Basic authentication over the `Authorization` header. Use only with
    /// HTTPS or on trusted networks.
    Basic {
        username: String,
        password: SecretString,
    },
    /// Kerberos authentication. The crate carries the configuration and
    /// delegates token minting to a [`TokenSource`]; constructing a
    /// transport for a Kerberos target without one is rejected.
    Kerberos {
        principal: String,
        realm: String,
        keytab: Option<String>,
        kdc: Option<String>,
    },
}

impl Auth {
    /// Create Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Auth::Basic {
            username: username.into(),
            password: SecretString::new(password.into().into()),
        }
    }

    /// Create Kerberos authentication.
    pub fn kerberos(principal: impl Into<String>, realm: impl Into<String>) -> Self {
        Auth::Kerberos {
            principal: principal.into(),
            realm: realm.into(),
            keytab: None,
            kdc: None,
        }
    }

    /// Create Kerberos authentication with an explicit keytab path.
    pub fn kerberos_with_keytab(
        principal: impl Into<String>,
        realm: impl Into<String>,
        keytab: impl Into<String>,
    ) -> Self {
        Auth::Kerberos {
            principal: principal.into(),
            realm: realm.into(),
            keytab: Some(keytab.into()),
            kdc: None,
        }
    }

    /// Get the authentication scheme name.
    pub fn scheme(&self) -> &'static str {
        match self {
            Auth::Basic { .. } => "Basic",
            Auth::Kerberos { .. } => "Kerberos",
        }
    }

    /// Get the username or principal.
    pub fn username(&self) -> &str {
        match self {
            Auth::Basic { username, .. } => username,
            Auth::Kerberos { principal, .. } => principal,
        }
    }

    /// Expose the Basic password for header construction. Returns `None`
    /// for Kerberos credentials.
    pub(crate) fn basic_password(&self) -> Option<&str> {
        match self {
            Auth::Basic { password, .. } => Some(password.expose_secret()),
            Auth::Kerberos { .. } => None,
        }
    }
}

/// Source of opaque authentication tokens for negotiated mechanisms.
///
/// Implementations wrap whatever GSSAPI or SSPI machinery the embedding
/// application has; the transport only needs the finished token to place
/// in the `Authorization: Negotiate` header.
pub trait TokenSource: Send + Sync {
    /// Mint a token for the given service principal name.
    fn token(&self, spn: &str) -> WinRmResult<String>;
}

// ============================================================================
// Connection Info
// ============================================================================

/// Connection parameters for one WS-Management target.
#[derive(Clone)]
pub struct ConnectionInfo {
    /// Target hostname or IP address
    hostname: String,
    /// WinRM port (default: 5985 for HTTP, 5986 for HTTPS)
    port: u16,
    /// Use HTTPS instead of HTTP
    use_ssl: bool,
    /// Verify TLS certificates
    verify_ssl: bool,
    /// Authentication method
    auth: Auth,
    /// Token source for negotiated authentication mechanisms
    token_source: Option<Arc<dyn TokenSource>>,
    /// Client-side HTTP request timeout
    request_timeout: Duration,
    /// Server-side operation timeout, sent in every envelope header
    operation_timeout: Duration,
    /// Maximum SOAP envelope size the server may send back
    max_envelope_size: u32,
    /// Code page for console output
    codepage: u32,
    /// Locale sent in envelope headers
    locale: String,
    /// Reuse the TCP connection across requests
    keep_alive: bool,
}

impl ConnectionInfo {
    /// Create connection info for a host with default settings and the
    /// given credentials.
    pub fn new(hostname: impl Into<String>, auth: Auth) -> Self {
        Self {
            hostname: hostname.into(),
            port: DEFAULT_WINRM_PORT,
            use_ssl: false,
            verify_ssl: true,
            auth,
            token_source: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_envelope_size: DEFAULT_MAX_ENVELOPE_SIZE,
            codepage: DEFAULT_CODEPAGE,
            locale: "en-US".to_string(),
            keep_alive: true,
        }
    }

    /// Returns a copy pointing at a different host. Port, credentials, and
    /// tuning carry over, which is what failover to a sibling node needs.
    pub fn with_hostname(&self, hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..self.clone()
        }
    }

    /// Returns a copy using the given port.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Returns a copy using HTTPS. Switches the port to the SSL default
    /// when the current port is the HTTP default.
    pub fn with_ssl(&self, verify: bool) -> Self {
        let port = if self.port == DEFAULT_WINRM_PORT {
            DEFAULT_WINRM_SSL_PORT
        } else {
            self.port
        };
        Self {
            port,
            use_ssl: true,
            verify_ssl: verify,
            ..self.clone()
        }
    }

    /// Returns a copy with a different request timeout.
    pub fn with_request_timeout(&self, timeout: Duration) -> Self {
        Self {
            request_timeout: timeout,
            ..self.clone()
        }
    }

    /// Returns a copy with a different server-side operation timeout.
    pub fn with_operation_timeout(&self, timeout: Duration) -> Self {
        Self {
            operation_timeout: timeout,
            ..self.clone()
        }
    }

    /// Returns a copy with the keep-alive mode set. When disabled, each
    /// request opens a fresh TCP connection.
    pub fn with_keep_alive(&self, keep_alive: bool) -> Self {
        Self {
            keep_alive,
            ..self.clone()
        }
    }

    /// Returns a copy with a different locale.
    pub fn with_locale(&self, locale: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            ..self.clone()
        }
    }

    /// Returns a copy with a token source for negotiated authentication.
    pub fn with_token_source(&self, source: Arc<dyn TokenSource>) -> Self {
        Self {
            token_source: Some(source),
            ..self.clone()
        }
    }

    /// Validate that the configuration is complete enough to open a
    /// transport.
    pub fn validate(&self) -> WinRmResult<()> {
        if self.hostname.is_empty() {
            return Err(WinRmError::InvalidParameter(
                "connection hostname is empty".to_string(),
            ));
        }
        if matches!(self.auth, Auth::Kerberos { .. }) && self.token_source.is_none() {
            return Err(WinRmError::InvalidParameter(
                "Kerberos authentication requires a token source".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the WS-Management endpoint URL.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{}://{}:{}/wsman", scheme, self.hostname, self.port)
    }

    /// Service principal name for negotiated authentication.
    pub fn service_principal(&self) -> String {
        format!("HTTP/{}", self.hostname)
    }

    /// Server-side operation timeout rendered as an ISO-8601 duration,
    /// e.g. `PT60S`.
    pub fn operation_timeout_iso8601(&self) -> String {
        format!("PT{}S", self.operation_timeout.as_secs())
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    pub fn verify_ssl(&self) -> bool {
        self.verify_ssl
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn token_source(&self) -> Option<&Arc<dyn TokenSource>> {
        self.token_source.as_ref()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    pub fn max_envelope_size(&self) -> u32 {
        self.max_envelope_size
    }

    pub fn codepage(&self) -> u32 {
        self.codepage
    }

    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }
}

// Manual impl: the token source is an opaque trait object, and the Auth
// password stays behind SecretString's own redaction.
impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("use_ssl", &self.use_ssl)
            .field("verify_ssl", &self.verify_ssl)
            .field("auth", &self.auth)
            .field(
                "token_source",
                &self.token_source.as_ref().map(|_| "dyn TokenSource"),
            )
            .field("request_timeout", &self.request_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .field("max_envelope_size", &self.max_envelope_size)
            .field("codepage", &self.codepage)
            .field("locale", &self.locale)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}
