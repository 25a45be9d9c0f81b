//! Main network handler: admin and mock listeners with graceful shutdown

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::{Result, StubvaultError};

use super::admin::AdminApi;
use super::connection_pool::ConnectionPool;
use super::http::{error_response, json_response, read_body, validate_request, HttpResponse};
use super::mock::{MockRequest, MockService};
use super::SHUTDOWN_TIMEOUT_MS;

/// Which listener a connection arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    Admin,
    Mock,
}

impl Listener {
    fn label(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Mock => "mock",
        }
    }
}

/// Per-request routing shared by every connection
struct Router {
    app: Arc<App>,
    admin: AdminApi,
    mock: MockService,
}

impl Router {
    async fn dispatch(
        &self,
        listener: Listener,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> HttpResponse {
        let limits = &self.app.config.limits;
        if let Err(e) = validate_request(&request, limits) {
            return match e {
                StubvaultError::DataTooLarge { .. } => error_response(&e),
                other => {
                    warn!("Rejecting request from {}: {}", peer, other);
                    json_response(
                        StatusCode::BAD_REQUEST,
                        &serde_json::json!({ "error": other.to_string() }),
                    )
                }
            };
        }

        let (parts, body) = request.into_parts();
        let body = match read_body(body, limits.max_request_size).await {
            Ok(body) => body,
            Err(e) => return error_response(&e),
        };

        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(str::to_string);

        info!(
            "{} {} {} from {} ({} bytes)",
            listener.label(),
            parts.method,
            path,
            peer,
            body.len()
        );

        match listener {
            Listener::Admin => self.admin.handle(&parts.method, &path, query.as_deref()).await,
            Listener::Mock => {
                self.mock
                    .handle(MockRequest {
                        method: parts.method,
                        path,
                        query,
                        headers: parts.headers,
                        body,
                    })
                    .await
            }
        }
    }
}

/// Main network handler that owns both listeners
pub struct NetworkHandler {
    router: Arc<Router>,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl NetworkHandler {
    /// Create a new network handler
    #[must_use]
    pub fn new(app: Arc<App>) -> Self {
        let max_connections = app.config.limits.max_connections;
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            router: Arc::new(Router {
                admin: AdminApi::new(Arc::clone(&app)),
                mock: MockService::new(Arc::clone(&app)),
                app,
            }),
            connection_pool: ConnectionPool::new(max_connections),
            shutdown_tx,
        }
    }

    /// Sender that stops the handler when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Bind the configured admin and mock ports and serve until shutdown
    ///
    /// # Errors
    ///
    /// Returns error if either port cannot be bound
    pub async fn run(self) -> Result<()> {
        let server = &self.router.app.config.server;
        let admin = bind(&server.bind_address, server.admin_port).await?;
        let mock = bind(&server.bind_address, server.mock_port).await?;
        self.serve(admin, mock).await
    }

    /// Serve on already bound listeners until Ctrl-C or a shutdown signal
    ///
    /// # Errors
    ///
    /// Returns error if a listener task fails
    pub async fn serve(self, admin: TcpListener, mock: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        for (kind, listener) in [(Listener::Admin, admin), (Listener::Mock, mock)] {
            info!("{} listener on {}", kind.label(), listener.local_addr()?);
            let router = Arc::clone(&self.router);
            let pool = self.connection_pool.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.spawn(accept_loop(kind, listener, router, pool, shutdown_rx));
        }

        let store = &self.router.app.store;
        store.set_running(true).await;

        let shutdown_signal = async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                }
            }
        };

        let mut outcome = Ok(());
        tokio::select! {
            () = shutdown_signal => {
                info!("Initiating graceful shutdown");
            }
            Some(result) = tasks.join_next() => {
                if let Err(e) = result {
                    error!("Listener task failed: {}", e);
                    outcome = Err(StubvaultError::Other(format!("Listener task failed: {e}")));
                }
            }
        }

        self.shutdown_tx.send(()).ok();
        store.set_running(false).await;

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        tokio::time::timeout(shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    warn!("Task cleanup error: {}", e);
                }
            }
        })
        .await
        .ok();

        info!("Shutdown complete");
        outcome
    }
}

async fn bind(address: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{address}:{port}");
    TcpListener::bind(&addr)
        .await
        .map_err(|e| StubvaultError::ConfigError(format!("Cannot bind {addr}: {e}")))
}

async fn accept_loop(
    kind: Listener,
    listener: TcpListener,
    router: Arc<Router>,
    pool: ConnectionPool,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let Some(guard) = pool.try_acquire() else {
                            warn!("Connection limit reached, rejecting {}", peer);
                            drop(stream);
                            continue;
                        };

                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            let _guard = guard;
                            serve_connection(kind, stream, peer, router).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("{} listener shutting down", kind.label());
                break;
            }
        }
    }
}

async fn serve_connection(kind: Listener, stream: TcpStream, peer: SocketAddr, router: Arc<Router>) {
    let service = service_fn(move |request| {
        let router = Arc::clone(&router);
        async move { Ok::<_, Infallible>(router.dispatch(kind, request, peer).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!("Connection from {} closed with error: {}", peer, e);
    }
}
