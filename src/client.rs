//! Transport-bound clients for one fixed backend
//!
//! A [`ClientFactory`] holds an address template (a unix socket path or a
//! network base address). The template is resolved on every connection, so a
//! socket created after the gateway started is picked up without a reload.

use crate::error::TransportError;
use crate::vars::VarResolver;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::header::{HeaderValue, HOST};
use hyper::http::uri::{Authority, PathAndQuery};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream to a backend, whichever transport carries it
pub trait BackendIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BackendIo for T {}

pub type BackendStream = Box<dyn BackendIo>;

/// Host used in the `Host` header and WebSocket URL for unix socket backends
const UNIX_SOCKET_HOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Path template of a unix domain socket
    UnixSocket(String),
    /// Base address template, e.g. `http://127.0.0.1:5173`
    Network(String),
}

/// A resolved backend address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    UnixSocket(PathBuf),
    Network {
        authority: Authority,
        /// Base path prepended to every request path, without trailing slash
        prefix: String,
    },
}

impl Endpoint {
    /// Value for the backend `Host` header
    pub fn host(&self) -> &str {
        match self {
            Endpoint::UnixSocket(_) => UNIX_SOCKET_HOST,
            Endpoint::Network { authority, .. } => authority.as_str(),
        }
    }

    /// Origin-form request target on the backend
    pub fn request_target(&self, path_and_query: Option<&PathAndQuery>) -> String {
        let pq = path_and_query.map(|pq| pq.as_str()).unwrap_or("/");
        match self {
            Endpoint::UnixSocket(_) => pq.to_string(),
            Endpoint::Network { prefix, .. } => format!("{}{}", prefix, pq),
        }
    }

    /// `ws://` URL for the backend WebSocket handshake
    pub fn websocket_url(&self, path_and_query: Option<&PathAndQuery>) -> String {
        format!("ws://{}{}", self.host(), self.request_target(path_and_query))
    }

    pub async fn connect(&self) -> Result<BackendStream, TransportError> {
        match self {
            Endpoint::UnixSocket(path) => connect_unix(path).await,
            Endpoint::Network { authority, .. } => {
                let addr = format!("{}:{}", authority.host(), authority.port_u16().unwrap_or(80));
                let stream = TcpStream::connect(&addr).await.map_err(|e| {
                    TransportError::ConnectionFailed(format!("{}: {}", addr, e))
                })?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(unix)]
async fn connect_unix(path: &std::path::Path) -> Result<BackendStream, TransportError> {
    let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
        TransportError::ConnectionFailed(format!("{}: {}", path.display(), e))
    })?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn connect_unix(path: &std::path::Path) -> Result<BackendStream, TransportError> {
    Err(TransportError::ConnectionFailed(format!(
        "{}: unix domain sockets are not supported on this platform",
        path.display()
    )))
}

fn parse_network_address(address: &str) -> Result<Endpoint, TransportError> {
    let uri = address
        .parse::<Uri>()
        .map_err(|e| {
            TransportError::Other(format!("invalid backend address '{}': {}", address, e))
        })?;

    if let Some(scheme) = uri.scheme_str() {
        if scheme != "http" {
            return Err(TransportError::Other(format!(
                "unsupported backend scheme '{}'",
                scheme
            )));
        }
    }

    let authority = uri
        .authority()
        .cloned()
        .ok_or_else(|| {
            TransportError::Other(format!("backend address '{}' has no host", address))
        })?;

    Ok(Endpoint::Network {
        authority,
        prefix: uri.path().trim_end_matches('/').to_string(),
    })
}

/// Constructs clients bound to one backend
#[derive(Debug, Clone)]
pub struct ClientFactory {
    transport: Transport,
    resolver: VarResolver,
}

impl ClientFactory {
    pub fn new(transport: Transport, resolver: VarResolver) -> Self {
        Self {
            transport,
            resolver,
        }
    }

    pub fn unix_socket(path: impl Into<String>, resolver: VarResolver) -> Self {
        Self::new(Transport::UnixSocket(path.into()), resolver)
    }

    pub fn network(base: impl Into<String>, resolver: VarResolver) -> Self {
        Self::new(Transport::Network(base.into()), resolver)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Resolve the address template to a concrete endpoint
    pub fn endpoint(&self) -> Result<Endpoint, TransportError> {
        let resolve = |template: &str| {
            self.resolver
                .resolve(template)
                .map_err(|e| TransportError::Other(e.to_string()))
        };

        match &self.transport {
            Transport::UnixSocket(template) => Ok(Endpoint::UnixSocket(resolve(template)?.into())),
            Transport::Network(template) => parse_network_address(&resolve(template)?),
        }
    }

    /// Send one request over a fresh HTTP/1.1 connection.
    ///
    /// `req` carries only the origin-form target; the `Host` header is set
    /// from the endpoint. The connection lives until the response body is
    /// consumed or dropped.
    pub async fn send_request<B>(
        &self,
        mut req: Request<B>,
    ) -> Result<Response<Incoming>, TransportError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let endpoint = self.endpoint()?;
        let target = endpoint.request_target(req.uri().path_and_query());
        *req.uri_mut() = target
            .parse::<Uri>()
            .map_err(|e| {
                TransportError::Other(format!("invalid request target '{}': {}", target, e))
            })?;
        let host = HeaderValue::from_str(endpoint.host())
            .map_err(|e| TransportError::Other(format!("invalid backend host: {}", e)))?;
        req.headers_mut().insert(HOST, host);

        let stream = endpoint.connect().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Backend connection closed with error");
            }
        });

        sender.send_request(req).await.map_err(|e| {
            if e.is_closed() || e.is_incomplete_message() || e.is_canceled() {
                TransportError::ConnectionFailed(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })
    }
}
