use std::time::Duration;

use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};

/// How the client authenticates during the WebSocket upgrade.
#[derive(Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    Basic {
        username: String,
        password: SecretString,
    },
    Bearer(SecretString),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::Bearer(_) => f.write_str("Bearer([REDACTED])"),
        }
    }
}

impl Credentials {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer(SecretString::from(token.into()))
    }

    /// Value for the `Authorization` upgrade header.
    pub fn authorization(&self) -> Option<String> {
        match self {
            Self::None => None,
            Self::Basic { username, password } => {
                let raw = format!("{}:{}", username, password.expose_secret());
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(raw)
                ))
            }
            Self::Bearer(token) => Some(format!("Bearer {}", token.expose_secret())),
        }
    }
}

/// Where and how to connect.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// `ws://` or `wss://` URL.
    pub endpoint: String,
    pub credentials: Credentials,
    /// Retry transient failures. When false the first transient failure
    /// during initialize fails it, and a dropped connection stays down.
    pub reconnect: bool,
    /// Upper bound for each of TCP connect and WebSocket upgrade.
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials: Credentials::None,
            reconnect: true,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
