//! Integration tests for Devgate

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use devgate::client::ClientFactory;
use devgate::gateway::{GatewayServer, RouteTable, Target};
use devgate::proxy::ReverseProxyEngine;
use devgate::static_files::StaticFiles;
use devgate::vars::VarResolver;
use futures::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(1);

/// Running gateway; dropping the handle leaves the task to the runtime
struct TestGateway {
    port: u16,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway(routes: RouteTable) -> TestGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = GatewayServer::new(listener.local_addr().unwrap(), Arc::new(routes), shutdown_rx);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    assert!(wait_for_port(port, Duration::from_secs(5)).await);
    TestGateway {
        port,
        _shutdown_tx: shutdown_tx,
    }
}

/// Gateway with a single proxy route to `backend`
async fn start_proxy_gateway(host: &str, backend: SocketAddr) -> TestGateway {
    start_gateway(RouteTable::new().with_route(host, proxy_to(backend))).await
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send HTTP request with custom Host header (for routing tests)
async fn http_get_with_host(
    port: u16,
    path: &str,
    host: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, host
    );
    raw_request(port, &request).await
}

async fn raw_request(port: u16, request: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Spawn an HTTP/1.1 backend running `handler` on every request
async fn spawn_backend<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Backend that answers with the request headers it received, one per line
async fn spawn_header_echo_backend() -> SocketAddr {
    spawn_backend(|req| async move {
        let mut body = format!("{} {}\n", req.method(), req.uri());
        for (name, value) in req.headers() {
            body.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("?")));
        }
        Response::builder()
            .header("x-backend", "echo")
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    })
    .await
}

fn proxy_to(addr: SocketAddr) -> Target {
    Target::Proxy(ReverseProxyEngine::new(
        ClientFactory::network(format!("http://{}", addr), VarResolver::default()),
        TIMEOUT,
    ))
}

/// An address nothing listens on
async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn test_unknown_host_without_default() {
    let backend = spawn_header_echo_backend().await;
    let gateway = start_proxy_gateway("app.localhost", backend).await;

    let response = http_get_with_host(gateway.port, "/", "other.localhost").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    assert!(response.ends_with("The resource is not available"), "{}", response);

    let response = http_get_with_host(gateway.port, "/", "app.localhost").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
}

#[tokio::test]
async fn test_unknown_host_uses_default_static_server() {
    let site = tempfile::tempdir().unwrap();
    std::fs::write(site.path().join("index.html"), "<h1>fallback</h1>").unwrap();

    let routes = RouteTable::new()
        .with_route("app.localhost", proxy_to(free_addr().await))
        .with_default(Target::Static(StaticFiles::new(site.path())));
    let gateway = start_gateway(routes).await;

    let response = http_get_with_host(gateway.port, "/", "whatever.localhost:8000").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.contains("text/html"), "{}", response);
    assert!(response.ends_with("<h1>fallback</h1>"), "{}", response);
}

#[tokio::test]
async fn test_host_matching_ignores_port_and_case() {
    let backend = spawn_header_echo_backend().await;
    let gateway = start_proxy_gateway("app.localhost", backend).await;

    let response = http_get_with_host(gateway.port, "/", "App.LocalHost:8000").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
}

#[tokio::test]
async fn test_forwarding_headers_reach_backend() {
    let backend = spawn_header_echo_backend().await;
    let gateway = start_proxy_gateway("app.localhost", backend).await;

    let response = http_get_with_host(gateway.port, "/users?page=2", "app.localhost:8000")
        .await
        .unwrap();
    let lower = response.to_lowercase();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(lower.contains("x-backend: echo"), "{}", response);
    assert!(response.contains("GET /users?page=2\n"), "{}", response);
    assert!(lower.contains("x-forwarded-for: 127.0.0.1\n"), "{}", response);
    assert!(lower.contains("x-forwarded-host: app.localhost:8000\n"), "{}", response);
    assert!(lower.contains("x-forwarded-proto: http\n"), "{}", response);
    assert!(
        lower.contains("forwarded: for=127.0.0.1;host=app.localhost:8000;proto=http\n"),
        "{}",
        response
    );
    assert!(lower.contains("x-request-id: "), "{}", response);
    // The client's Host is replaced by the backend authority
    assert!(lower.contains(&format!("\nhost: {}\n", backend)), "{}", response);
    assert!(!lower.contains("\nhost: app.localhost:8000\n"), "{}", response);
}

#[tokio::test]
async fn test_request_id_is_propagated() {
    let backend = spawn_header_echo_backend().await;
    let gateway = start_proxy_gateway("app.localhost", backend).await;

    let response = raw_request(
        gateway.port,
        "GET / HTTP/1.1\r\nHost: app.localhost\r\nX-Request-Id: req-42\r\n\
         Connection: close\r\n\r\n",
    )
    .await
    .unwrap();
    assert!(response.contains("x-request-id: req-42\n"), "{}", response);
}

#[tokio::test]
async fn test_compressed_response_is_decoded() {
    use async_compression::tokio::bufread::GzipEncoder;
    use hyper::client::conn::http1;

    let backend = spawn_backend(|req| async move {
        let accepted = req
            .headers()
            .get("accept-encoding")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mut gzipped = Vec::new();
        GzipEncoder::new(&b"hello"[..])
            .read_to_end(&mut gzipped)
            .await
            .unwrap();
        Response::builder()
            .header("content-encoding", "gzip")
            .header("content-length", gzipped.len())
            .header("x-custom", "kept")
            .header("x-seen-accept-encoding", accepted)
            .body(Full::new(Bytes::from(gzipped)))
            .unwrap()
    })
    .await;
    let routes = RouteTable::new().with_route("app.localhost", proxy_to(backend));
    let gateway = start_gateway(routes).await;

    let stream = TcpStream::connect(("127.0.0.1", gateway.port)).await.unwrap();
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.unwrap();
    tokio::spawn(conn);
    let request = Request::builder()
        .uri("/")
        .header("host", "app.localhost")
        .header("accept-encoding", "gzip")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.status(), 200);
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(response.headers()["x-custom"], "kept");
    assert_eq!(response.headers()["x-seen-accept-encoding"], "gzip");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"hello"));
}

#[tokio::test]
async fn test_backend_status_is_passed_through() {
    let backend = spawn_backend(|_req| async {
        Response::builder()
            .status(418)
            .body(Full::new(Bytes::from_static(b"teapot")))
            .unwrap()
    })
    .await;
    let gateway = start_proxy_gateway("app.localhost", backend).await;

    let response = http_get_with_host(gateway.port, "/", "app.localhost").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 418"), "{}", response);
    assert!(response.ends_with("teapot"), "{}", response);
}

#[tokio::test]
async fn test_post_body_is_streamed_to_backend() {
    let backend = spawn_backend(|req| async move {
        let bytes = req.into_body().collect().await.unwrap().to_bytes();
        Response::new(Full::new(bytes))
    })
    .await;
    let gateway = start_proxy_gateway("app.localhost", backend).await;

    let body = "name=devgate&kind=gateway";
    let request = format!(
        "POST /submit HTTP/1.1\r\nHost: app.localhost\r\n\
         Content-Type: application/x-www-form-urlencoded\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = raw_request(gateway.port, &request).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with(body), "{}", response);
}

#[tokio::test]
async fn test_post_body_large() {
    let backend = spawn_backend(|req| async move {
        let len = req.into_body().collect().await.unwrap().to_bytes().len();
        Response::new(Full::new(Bytes::from(len.to_string())))
    })
    .await;
    let gateway = start_proxy_gateway("app.localhost", backend).await;

    let body = "x".repeat(256 * 1024);
    let request = format!(
        "POST / HTTP/1.1\r\nHost: app.localhost\r\nContent-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = raw_request(gateway.port, &request).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with(&(256 * 1024).to_string()), "{}", response);
}

#[tokio::test]
async fn test_silent_backend_times_out_with_504() {
    // Accepts connections but never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    let gateway = start_proxy_gateway("app.localhost", addr).await;

    let started = std::time::Instant::now();
    let response = http_get_with_host(gateway.port, "/", "app.localhost").await.unwrap();

    assert!(response.starts_with("HTTP/1.1 504"), "{}", response);
    assert!(response.to_lowercase().contains("x-gateway-error: request_timeout"), "{}", response);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_refused_backend_is_502() {
    let gateway = start_gateway(
        RouteTable::new().with_route("app.localhost", proxy_to(free_addr().await)),
    )
    .await;

    let response = http_get_with_host(gateway.port, "/", "app.localhost").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);
    assert!(response.to_lowercase().contains("x-gateway-error: connection_failed"), "{}", response);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_backend_created_after_start() {
    use devgate::dirs::{BaseDirs, DirectoryScope};
    use tokio::net::UnixListener;

    let tmp = tempfile::tempdir().unwrap();
    let scope = DirectoryScope::new(
        BaseDirs::new(tmp.path().join("run"), tmp.path().join("state")),
        "scope",
    );
    let resolver = VarResolver::for_services(&scope, ["api"]);
    let routes = RouteTable::new().with_route(
        "api.localhost",
        Target::Proxy(ReverseProxyEngine::new(
            ClientFactory::unix_socket("{api.xdg_run}/app.sock", resolver),
            TIMEOUT,
        )),
    );
    let gateway = start_gateway(routes).await;

    // Nothing listens yet
    let response = http_get_with_host(gateway.port, "/", "api.localhost").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502"), "{}", response);

    let api_scope = scope.join("api");
    api_scope.create_all().unwrap();
    let listener = UnixListener::bind(api_scope.runtime_dir().join("app.sock")).unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let host = req
                        .headers()
                        .get("host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(format!(
                        "uds {} host={}",
                        req.uri(),
                        host
                    )))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    let response = http_get_with_host(gateway.port, "/ping?x=1", "api.localhost").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
    assert!(response.ends_with("uds /ping?x=1 host=localhost"), "{}", response);
}

#[tokio::test]
async fn test_gateway_stops_on_shutdown_signal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let addr = listener.local_addr().unwrap();
    let server = GatewayServer::new(addr, Arc::new(RouteTable::new()), shutdown_rx);
    let handle = tokio::spawn(server.serve(listener));

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
}

/// WebSocket backend echoing text/binary, closing with 1000 "bye" on "close"
async fn spawn_ws_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) if text == "close" => {
                            let _ = ws
                                .close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "bye".into(),
                                }))
                                .await;
                        }
                        message @ (Message::Text(_) | Message::Binary(_)) => {
                            if ws.send(message).await.is_err() {
                                return;
                            }
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_websocket_messages_are_relayed_in_order() {
    let backend = spawn_ws_backend().await;
    let gateway = start_proxy_gateway("127.0.0.1", backend).await;

    let url = format!("ws://127.0.0.1:{}/live", gateway.port);
    let (mut ws, response) = tokio_tungstenite::connect_async(url).await.unwrap();
    assert_eq!(response.status(), 101);

    for i in 0..5 {
        ws.send(Message::Text(format!("msg {}", i))).await.unwrap();
    }
    ws.send(Message::Binary(vec![0, 1, 2, 255])).await.unwrap();

    for i in 0..5 {
        let message = ws.next().await.unwrap().unwrap();
        assert_eq!(message, Message::Text(format!("msg {}", i)));
    }
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::Binary(vec![0, 1, 2, 255]));
}

#[tokio::test]
async fn test_websocket_backend_close_reaches_client() {
    let backend = spawn_ws_backend().await;
    let gateway = start_proxy_gateway("127.0.0.1", backend).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/", gateway.port))
        .await
        .unwrap();
    ws.send(Message::Text("close".into())).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match message {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert_eq!(frame.reason, "bye");
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_websocket_subprotocol_is_negotiated_with_backend() {
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as WsRequest, Response as WsResponse,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |req: &WsRequest,
                        mut response: WsResponse|
         -> Result<WsResponse, ErrorResponse> {
            let offered = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if offered.split(',').any(|p| p.trim() == "chat") {
                response
                    .headers_mut()
                    .insert("sec-websocket-protocol", "chat".parse().unwrap());
            }
            Ok(response)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if message.is_text() && ws.send(message).await.is_err() {
                return;
            }
        }
    });
    let gateway = start_proxy_gateway("127.0.0.1", backend).await;

    let mut request = format!("ws://127.0.0.1:{}/", gateway.port)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", "superchat, chat".parse().unwrap());
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();

    assert_eq!(response.headers()["sec-websocket-protocol"], "chat");
    ws.send(Message::Text("hi".into())).await.unwrap();
    assert_eq!(ws.next().await.unwrap().unwrap(), Message::Text("hi".into()));
}

#[tokio::test]
async fn test_websocket_to_unreachable_backend_is_502() {
    let gateway = start_gateway(
        RouteTable::new().with_route("127.0.0.1", proxy_to(free_addr().await)),
    )
    .await;

    let err = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/", gateway.port))
        .await
        .err()
        .unwrap();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 502);
        }
        other => panic!("expected HTTP error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_websocket_client_close_reaches_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Close(frame) = message {
                let seen = frame.map(|f| (u16::from(f.code), f.reason.to_string()));
                let _ = close_tx.send(seen);
                return;
            }
        }
    });
    let gateway = start_proxy_gateway("127.0.0.1", backend).await;

    let url = format!("ws://127.0.0.1:{}/", gateway.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws.close(Some(CloseFrame {
        code: CloseCode::from(4001),
        reason: "client-bye".into(),
    }))
    .await
    .unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), close_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen, Some((4001, "client-bye".to_string())));
}
