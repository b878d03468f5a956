//! Admin RPC server
//!
//! A small HTTP/JSON surface for operators and the control CLI: trigger a
//! hitless restart, stop an app, and inspect supervisor state.

use crate::error::Error;
use crate::supervisor::Supervisor;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Plain-text RPC reply
fn text_reply(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Full::new(body.into()))
        .expect("static parts always form a valid response")
}

/// JSON RPC reply built from a serde_json value
fn json_reply(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .expect("static parts always form a valid response")
}

/// Admin RPC server bound to the configured address
pub struct RpcServer {
    listener: TcpListener,
    supervisor: Arc<Supervisor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RpcServer {
    /// Bind the RPC listener; failure here is fatal at startup
    pub async fn bind(
        addr: SocketAddr,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            supervisor,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "admin RPC listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let supervisor = Arc::clone(&supervisor);
                                    async move { handle_rpc_request(req, supervisor).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "rpc connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept rpc connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("admin RPC shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_rpc_request(
    req: Request<hyper::body::Incoming>,
    supervisor: Arc<Supervisor>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "rpc request");

    let response = match (method, path) {
        // Liveness of the supervisor itself
        (&Method::GET, "/health") => text_reply(StatusCode::OK, "ok"),

        // Full supervisor snapshot
        (&Method::GET, "/status") => match serde_json::to_value(supervisor.status()) {
            Ok(snapshot) => json_reply(StatusCode::OK, snapshot),
            Err(e) => {
                error!(error = %e, "failed to serialize status");
                text_reply(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
            }
        },

        // Hitless restart: POST /apps/{name}/start
        (&Method::POST, path) if path.starts_with("/apps/") && path.ends_with("/start") => {
            let name = path
                .strip_prefix("/apps/")
                .and_then(|p| p.strip_suffix("/start"))
                .unwrap_or("");
            if name.is_empty() {
                text_reply(StatusCode::BAD_REQUEST, "missing app name")
            } else {
                match supervisor.start_instance(name) {
                    Ok(id) => {
                        info!(app = name, instance = id, "instance start requested via rpc");
                        json_reply(
                            StatusCode::OK,
                            serde_json::json!({ "app": name, "instance": id }),
                        )
                    }
                    Err(Error::UnknownApp(_)) => text_reply(StatusCode::NOT_FOUND, "unknown app"),
                    Err(e @ Error::PortsExhausted) => json_reply(
                        StatusCode::SERVICE_UNAVAILABLE,
                        serde_json::json!({ "error": e.to_string() }),
                    ),
                    Err(e) => {
                        error!(app = name, error = %e, "failed to start instance");
                        text_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                    }
                }
            }
        }

        // Stop all instances: POST /apps/{name}/stop
        (&Method::POST, path) if path.starts_with("/apps/") && path.ends_with("/stop") => {
            let name = path
                .strip_prefix("/apps/")
                .and_then(|p| p.strip_suffix("/stop"))
                .unwrap_or("");
            if name.is_empty() {
                text_reply(StatusCode::BAD_REQUEST, "missing app name")
            } else {
                match supervisor.stop_app(name) {
                    Ok(()) => {
                        info!(app = name, "app stop requested via rpc");
                        json_reply(
                            StatusCode::OK,
                            serde_json::json!({ "app": name, "stopping": true }),
                        )
                    }
                    Err(Error::UnknownApp(_)) => text_reply(StatusCode::NOT_FOUND, "unknown app"),
                    Err(e) => {
                        error!(app = name, error = %e, "failed to stop app");
                        text_reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                    }
                }
            }
        }

        // 404 for everything else
        _ => text_reply(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}
