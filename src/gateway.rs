//! Virtual-host routing and the front-door accept loop

use crate::config::{Config, TargetConfig};
use crate::client::ClientFactory;
use crate::dirs::DirectoryScope;
use crate::error::resource_not_available;
use crate::proxy::{RequestContext, ReverseProxyEngine, X_REQUEST_ID};
use crate::static_files::StaticFiles;
use crate::vars::VarResolver;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway produces
pub type GatewayBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> GatewayBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed_unsync()
}

pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed_unsync()
}

/// What a virtual host serves
#[derive(Debug, Clone)]
pub enum Target {
    Static(StaticFiles),
    Proxy(ReverseProxyEngine),
}

impl Target {
    /// Build a target; address templates stay unresolved until a request needs them
    pub fn from_config(
        config: &TargetConfig,
        resolver: &VarResolver,
        request_timeout: Duration,
    ) -> Self {
        match config {
            TargetConfig::Static { root_path } => Target::Static(StaticFiles::new(root_path)),
            TargetConfig::UnixSocket { uds } => Target::Proxy(ReverseProxyEngine::new(
                ClientFactory::unix_socket(uds.clone(), resolver.clone()),
                request_timeout,
            )),
            TargetConfig::Network { target } => Target::Proxy(ReverseProxyEngine::new(
                ClientFactory::network(target.clone(), resolver.clone()),
                request_timeout,
            )),
        }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        ctx: &RequestContext,
    ) -> Response<GatewayBody> {
        match self {
            // Static targets answer WebSocket upgrades as plain HTTP
            Target::Static(files) => files.serve(&req).await,
            Target::Proxy(engine) => engine.handle(req, ctx).await,
        }
    }
}

/// Immutable map from lowercased virtual host to target
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Target>,
    default: Option<Target>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, host: &str, target: Target) -> Self {
        self.routes.insert(host.to_ascii_lowercase(), target);
        self
    }

    pub fn with_default(mut self, target: Target) -> Self {
        self.default = Some(target);
        self
    }

    /// Routes for every configured server; targets get qualified access to the service dirs
    pub fn from_config(config: &Config, scope: &DirectoryScope) -> Self {
        let resolver = VarResolver::for_services(scope, config.service_names());
        let timeout = config.server.request_timeout();

        let mut table = config
            .servers
            .iter()
            .fold(Self::new(), |table, (host, target)| {
                table.with_route(host, Target::from_config(target, &resolver, timeout))
            });
        if let Some(target) = &config.default_server {
            table = table.with_default(Target::from_config(target, &resolver, timeout));
        }
        table
    }

    /// Configured hosts, sorted
    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        hosts.sort_unstable();
        hosts
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Target for `host`, falling back to the default target
    pub fn resolve(&self, host: Option<&str>) -> Option<&Target> {
        host.and_then(|h| self.routes.get(h))
            .or(self.default.as_ref())
    }

    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        ctx: &RequestContext,
    ) -> Response<GatewayBody> {
        let hostname = ctx.host.as_deref().and_then(extract_hostname);
        match self.resolve(hostname.as_deref()) {
            Some(target) => target.handle(req, ctx).await,
            None => {
                debug!(host = ?ctx.host, request_id = %ctx.request_id, "No route for host");
                resource_not_available()
            }
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Lowercased hostname with any port stripped, `None` if malformed
pub fn extract_hostname(host: &str) -> Option<String> {
    let hostname = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal
        let end = rest.find(']')?;
        &host[..end + 2]
    } else {
        host.split(':').next()?
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Validate characters: alphanumeric, hyphen, dot, and IPv6 literal syntax
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '[' | ']' | ':'))
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Host as sent by the client: the Host header, or the URI authority (HTTP/2)
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

/// The front door: accepts connections and dispatches through a [`RouteTable`]
pub struct GatewayServer {
    bind_addr: SocketAddr,
    routes: Arc<RouteTable>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        routes: Arc<RouteTable>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            routes,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");
        for host in self.routes.hosts() {
            info!("Will serve VHost at http://{}:{}/", host, local_addr.port());
        }
        if self.routes.has_default() {
            info!("Will serve unmatched hosts with the default server");
        }

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let routes = Arc::clone(&self.routes);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, routes).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    routes: Arc<RouteTable>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        async move { handle_request(req, routes, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    routes: Arc<RouteTable>,
    client_addr: SocketAddr,
) -> Result<Response<GatewayBody>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = RequestContext {
        client_addr,
        host: request_host(&req),
        scheme: "http",
        request_id,
    };

    debug!(
        host = ?ctx.host,
        method = %req.method(),
        uri = %req.uri(),
        request_id = %ctx.request_id,
        "Incoming request"
    );

    Ok(routes.dispatch(req, &ctx).await)
}
