//! Reverse proxy engine bound to one backend
//!
//! Plain HTTP requests are forwarded over a fresh backend connection with
//! streaming bodies in both directions. WebSocket upgrades are terminated on
//! both sides and relayed message by message, so close codes and reasons
//! carry across.

use crate::client::{ClientFactory, Endpoint};
use crate::content_coding::decode_response;
use crate::error::{json_error_response, GatewayErrorCode, TransportError};
use crate::gateway::{empty_body, full_body, GatewayBody};
use futures::{Sink, SinkExt, Stream, StreamExt};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, SEC_WEBSOCKET_ACCEPT,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// RFC 7239 forwarding header
const FORWARDED: &str = "forwarded";

/// Upper bound on flushing close frames once a relay has finished
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-request facts the gateway learned from the inbound connection
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_addr: SocketAddr,
    /// Host as the client sent it, port included
    pub host: Option<String>,
    pub scheme: &'static str,
    pub request_id: String,
}

/// Relays requests to the backend addressed by one [`ClientFactory`]
#[derive(Debug, Clone)]
pub struct ReverseProxyEngine {
    clients: ClientFactory,
    request_timeout: Duration,
}

impl ReverseProxyEngine {
    pub fn new(clients: ClientFactory, request_timeout: Duration) -> Self {
        Self {
            clients,
            request_timeout,
        }
    }

    pub fn clients(&self) -> &ClientFactory {
        &self.clients
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        ctx: &RequestContext,
    ) -> Response<GatewayBody> {
        if is_websocket_request(&req) {
            self.handle_websocket(req, ctx).await
        } else {
            self.handle_http(req, ctx).await
        }
    }

    async fn handle_http(
        &self,
        req: Request<Incoming>,
        ctx: &RequestContext,
    ) -> Response<GatewayBody> {
        let (mut parts, body) = req.into_parts();
        set_forwarding_headers(&mut parts.headers, ctx);
        parts.version = Version::HTTP_11;
        let head_request = parts.method == Method::HEAD;
        let backend_req = Request::from_parts(parts, body);

        debug!(
            request_id = %ctx.request_id,
            method = %backend_req.method(),
            uri = %backend_req.uri(),
            "Forwarding request"
        );

        let result = tokio::time::timeout(
            self.request_timeout,
            self.clients.send_request(backend_req),
        )
        .await;

        match result {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                let body = decode_response(&mut parts, body, head_request);
                Response::from_parts(parts, body)
            }
            Ok(Err(e)) => {
                warn!(request_id = %ctx.request_id, error = %e, "Failed to forward request");
                e.into_response()
            }
            Err(_) => {
                warn!(
                    request_id = %ctx.request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                TransportError::Timeout(self.request_timeout).into_response()
            }
        }
    }

    async fn handle_websocket(
        &self,
        req: Request<Incoming>,
        ctx: &RequestContext,
    ) -> Response<GatewayBody> {
        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY).cloned() else {
            return json_error_response(
                GatewayErrorCode::InvalidUpgrade,
                "Missing Sec-WebSocket-Key header",
            );
        };

        let endpoint = match self.clients.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(request_id = %ctx.request_id, error = %e, "Failed to resolve backend");
                return e.into_response();
            }
        };

        let url = endpoint.websocket_url(req.uri().path_and_query());
        let mut backend_req = match url.as_str().into_client_request() {
            Ok(r) => r,
            Err(e) => return TransportError::Other(e.to_string()).into_response(),
        };
        if let Some(protocols) = joined_header(req.headers(), SEC_WEBSOCKET_PROTOCOL) {
            backend_req
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, protocols);
        }

        let handshake = tokio::time::timeout(
            self.request_timeout,
            connect_websocket(&endpoint, backend_req),
        )
        .await;

        let (backend, selected_protocol) = match handshake {
            Ok(Ok(connected)) => connected,
            Ok(Err(HandshakeFailure::Rejected(response))) => {
                warn!(
                    request_id = %ctx.request_id,
                    status = %response.status(),
                    "Backend rejected upgrade request"
                );
                return response;
            }
            Ok(Err(HandshakeFailure::Transport(e))) => {
                warn!(request_id = %ctx.request_id, error = %e, "WebSocket handshake failed");
                return e.into_response();
            }
            Err(_) => {
                warn!(request_id = %ctx.request_id, url = %url, "WebSocket handshake timed out");
                return TransportError::Timeout(self.request_timeout).into_response();
            }
        };

        let mut response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));
        if let Some(protocol) = selected_protocol {
            response = response.header(SEC_WEBSOCKET_PROTOCOL, protocol);
        }

        info!(request_id = %ctx.request_id, url = %url, "WebSocket upgrade successful");

        let request_id = ctx.request_id.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    relay(client, backend, &request_id).await;
                }
                Err(e) => {
                    error!(
                        request_id = %request_id,
                        error = %e,
                        "Failed to upgrade client connection"
                    );
                }
            }
            debug!(request_id = %request_id, "WebSocket connection closed");
        });

        response
            .body(empty_body())
            .expect("valid response builder")
    }
}

enum HandshakeFailure {
    /// Backend answered the upgrade with a regular HTTP response
    Rejected(Response<GatewayBody>),
    Transport(TransportError),
}

impl From<TransportError> for HandshakeFailure {
    fn from(e: TransportError) -> Self {
        HandshakeFailure::Transport(e)
    }
}

type BackendSocket = WebSocketStream<crate::client::BackendStream>;

async fn connect_websocket(
    endpoint: &Endpoint,
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
) -> Result<(BackendSocket, Option<HeaderValue>), HandshakeFailure> {
    let stream = endpoint.connect().await?;
    match client_async(request, stream).await {
        Ok((socket, response)) => {
            let protocol = response.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();
            Ok((socket, protocol))
        }
        Err(WsError::Http(response)) => {
            let mut rejected = Response::builder().status(response.status());
            for (name, value) in response.headers() {
                // The body below is whatever was buffered with the head
                if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                    continue;
                }
                rejected = rejected.header(name, value);
            }
            let body = response.body().clone().unwrap_or_default();
            let rejected = rejected
                .body(full_body(body))
                .map_err(|e| TransportError::Other(e.to_string()))?;
            Err(HandshakeFailure::Rejected(rejected))
        }
        Err(WsError::Io(e)) => Err(TransportError::ConnectionFailed(e.to_string()).into()),
        Err(e) => Err(TransportError::Other(e.to_string()).into()),
    }
}

/// Pump messages both ways until either side closes or fails
async fn relay<C, B>(client: WebSocketStream<C>, backend: WebSocketStream<B>, request_id: &str)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    tokio::select! {
        _ = pump(&mut client_rx, &mut backend_tx) => {
            debug!(request_id, "Client side of WebSocket finished");
        }
        _ = pump(&mut backend_rx, &mut client_tx) => {
            debug!(request_id, "Backend side of WebSocket finished");
        }
    }

    // Flush pending close replies on both hops
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
        let _ = client_tx.close().await;
        let _ = backend_tx.close().await;
    })
    .await;
}

async fn pump<S, K>(source: &mut S, sink: &mut K)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = source.next().await {
        match message {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "WebSocket write failed");
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "Relaying WebSocket close");
                let _ = sink.send(Message::Close(frame)).await;
                return;
            }
            // Ping/pong are answered per hop
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "WebSocket read failed");
                return;
            }
        }
    }
}

/// All lines of a list-valued header as one comma-separated value
fn joined_header(headers: &HeaderMap, name: HeaderName) -> Option<HeaderValue> {
    let values: Vec<&str> = headers
        .get_all(&name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        return None;
    }
    HeaderValue::from_str(&values.join(", ")).ok()
}

/// Check if a request is a WebSocket upgrade request
pub fn is_websocket_request<B>(req: &Request<B>) -> bool {
    // Check for Connection: Upgrade header (case-insensitive value check)
    let has_upgrade_connection = req
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let upgrades_to_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_connection && upgrades_to_websocket
}

/// Replace client-supplied forwarding headers and drop `host`
pub fn set_forwarding_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    headers.remove(HOST);

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    // Overwrite rather than append: this gateway is the first hop
    let client_ip = ctx.client_addr.ip();
    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let host = ctx.host.as_deref().unwrap_or_default();
    match HeaderValue::from_str(host) {
        Ok(value) if !host.is_empty() => {
            headers.insert(X_FORWARDED_HOST, value);
        }
        _ => {
            headers.remove(X_FORWARDED_HOST);
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(ctx.scheme));

    let forwarded = format!(
        "for={};host={};proto={}",
        forwarded_node(client_ip),
        host,
        ctx.scheme
    );
    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert(FORWARDED, value);
    }
}

/// IPv6 nodes are quoted and bracketed in `Forwarded`
fn forwarded_node(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("\"[{}]\"", v6),
    }
}
