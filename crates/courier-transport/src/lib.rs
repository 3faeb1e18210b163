// TLS socket transport for the push gateway and feedback endpoints.
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

mod connection;
pub mod tls;

pub use connection::{Connection, ConnectionId, ConnectionReader, ConnectionState, ConnectionWriter};
pub use tls::Credentials;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
    #[error("TLS handshake with {endpoint} failed: {source}")]
    HandshakeFailed {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("read failed: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("connection is not open")]
    NotOpen,
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("credentials: {0}")]
    Credentials(String),
}

/// Host and port of a gateway or feedback service.
///
/// Accepts `host:port` or `scheme://host:port`; the scheme is informational.
///
/// ```
/// use courier_transport::Endpoint;
///
/// let endpoint: Endpoint = "apn://gateway.push.apple.com:2195".parse().expect("endpoint");
/// assert_eq!(endpoint.host, "gateway.push.apple.com");
/// assert_eq!(endpoint.port, 2195);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || TransportError::InvalidEndpoint(value.to_string());
        let authority = match value.split_once("://") {
            Some((_, rest)) => rest,
            None => value,
        };
        let authority = authority.trim_end_matches('/');
        let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Byte stream a [`Connection`] runs over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Produces freshly established streams to one endpoint.
///
/// The pool and the feedback reader only see this trait, so tests can swap
/// the TLS dialer for an in-memory one.
pub trait Dial: Send + Sync + 'static {
    fn endpoint(&self) -> &Endpoint;

    fn dial(&self) -> impl Future<Output = Result<BoxedStream>> + Send;
}

/// Dials TCP and performs a client-authenticated TLS handshake.
#[derive(Clone)]
pub struct TlsDialer {
    endpoint: Endpoint,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsDialer {
    pub fn new(
        endpoint: Endpoint,
        tls: Arc<rustls::ClientConfig>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|_| TransportError::InvalidServerName(endpoint.host.clone()))?;
        Ok(Self {
            endpoint,
            server_name,
            connector: TlsConnector::from(tls),
            connect_timeout,
        })
    }
}

impl fmt::Debug for TlsDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsDialer")
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Dial for TlsDialer {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn dial(&self) -> Result<BoxedStream> {
        let endpoint = self.endpoint.to_string();
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                endpoint: endpoint.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| TransportError::ConnectFailed {
                endpoint: endpoint.clone(),
                source,
            })?;
        tcp.set_nodelay(true)
            .map_err(|source| TransportError::ConnectFailed {
                endpoint: endpoint.clone(),
                source,
            })?;
        tracing::debug!(%endpoint, "tcp connected; starting TLS handshake");

        // The handshake shares the connect budget; a silent peer would
        // otherwise hold the open forever.
        let stream = tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            endpoint: endpoint.clone(),
            timeout: self.connect_timeout,
        })?
        .map_err(|source| TransportError::HandshakeFailed {
            endpoint: endpoint.clone(),
            source,
        })?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_scheme_and_port() {
        let endpoint: Endpoint = "apn://feedback.sandbox.push.apple.com:2196"
            .parse()
            .expect("endpoint");
        assert_eq!(endpoint, Endpoint::new("feedback.sandbox.push.apple.com", 2196));
        assert_eq!(endpoint.to_string(), "feedback.sandbox.push.apple.com:2196");
    }

    #[test]
    fn endpoint_parses_bare_authority() {
        let endpoint: Endpoint = "127.0.0.1:2195".parse().expect("endpoint");
        assert_eq!(endpoint, Endpoint::new("127.0.0.1", 2195));
        let v6: Endpoint = "tls://[::1]:2195/".parse().expect("endpoint");
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:2195");
    }

    #[test]
    fn endpoint_rejects_missing_port() {
        for bad in ["gateway.push.apple.com", "apn://:2195", "host:notaport", "host:70000"] {
            assert!(
                matches!(bad.parse::<Endpoint>(), Err(TransportError::InvalidEndpoint(_))),
                "{bad} should not parse"
            );
        }
    }
}
