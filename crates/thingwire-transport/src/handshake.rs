//! One connection attempt: resolve, connect, upgrade.

use std::net::SocketAddr;

use thingwire_core::ConnectionError;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::config::{Credentials, TransportConfig};
use crate::state::ConnectionState;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub(crate) struct Endpoint {
    url: Url,
    host: String,
    port: u16,
}

impl Endpoint {
    pub(crate) fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let url = Url::parse(raw).map_err(|e| ConnectionError::InvalidEndpoint(format!("{raw}: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConnectionError::InvalidEndpoint(format!(
                "{raw}: scheme must be ws or wss"
            )));
        }
        if url.scheme() == "wss" && !cfg!(feature = "rustls-tls") {
            return Err(ConnectionError::InvalidEndpoint(format!(
                "{raw}: wss requires the rustls-tls feature"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ConnectionError::InvalidEndpoint(format!("{raw}: missing host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ConnectionError::InvalidEndpoint(format!("{raw}: missing port")))?;
        Ok(Self { url, host, port })
    }

    fn request(&self, credentials: &Credentials) -> Result<Request, ConnectionError> {
        let mut request = self.url.as_str().into_client_request().map_err(classify)?;
        if let Some(authorization) = credentials.authorization() {
            let value = HeaderValue::from_str(&authorization)
                .map_err(|e| ConnectionError::InvalidEndpoint(format!("credentials: {e}")))?;
            let _ = request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// Run one attempt. The caller has already published `Connecting`;
/// `on_phase` receives `Authenticating` once TCP is up.
pub(crate) async fn open(
    config: &TransportConfig,
    on_phase: impl Fn(ConnectionState),
) -> Result<WsStream, ConnectionError> {
    let endpoint = Endpoint::parse(&config.endpoint)?;

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| ConnectionError::HostUnresolvable {
            host: endpoint.host.clone(),
            reason: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectionError::HostUnresolvable {
            host: endpoint.host.clone(),
            reason: "no addresses".into(),
        });
    }

    let tcp = match timeout(config.connect_timeout, TcpStream::connect(&addrs[..])).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(e)) => {
            return Err(ConnectionError::HandshakeReset(format!(
                "tcp connect to {}:{}: {e}",
                endpoint.host, endpoint.port
            )))
        }
        Err(_) => {
            return Err(ConnectionError::HandshakeReset(format!(
                "tcp connect timed out after {:?}",
                config.connect_timeout
            )))
        }
    };
    let _ = tcp.set_nodelay(true);
    debug!(host = %endpoint.host, port = endpoint.port, "tcp connected");

    on_phase(ConnectionState::Authenticating);
    let request = endpoint.request(&config.credentials)?;
    match timeout(config.connect_timeout, upgrade(request, tcp)).await {
        Ok(Ok(ws)) => {
            debug!(host = %endpoint.host, "websocket upgraded");
            Ok(ws)
        }
        Ok(Err(e)) => Err(classify(e)),
        Err(_) => Err(ConnectionError::HandshakeReset(format!(
            "upgrade timed out after {:?}",
            config.connect_timeout
        ))),
    }
}

#[cfg(feature = "rustls-tls")]
async fn upgrade(request: Request, tcp: TcpStream) -> Result<WsStream, WsError> {
    let (ws, _) = tokio_tungstenite::client_async_tls(request, tcp).await?;
    Ok(ws)
}

#[cfg(not(feature = "rustls-tls"))]
async fn upgrade(request: Request, tcp: TcpStream) -> Result<WsStream, WsError> {
    let (ws, _) = tokio_tungstenite::client_async(request, MaybeTlsStream::Plain(tcp)).await?;
    Ok(ws)
}

fn classify(err: WsError) -> ConnectionError {
    match err {
        WsError::Http(response) => ConnectionError::from_handshake_status(response.status().as_u16()),
        WsError::Url(e) => ConnectionError::InvalidEndpoint(e.to_string()),
        other => ConnectionError::HandshakeReset(other.to_string()),
    }
}
