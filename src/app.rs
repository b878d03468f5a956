//! Per-application supervision and traffic switching
//!
//! An [`App`] owns every instance ever created for one configured
//! application, selects which one is active, and front-ends external traffic
//! with a reverse proxy that pins each request to the instance that was
//! active when the request was admitted.

use crate::config::AppConfig;
use crate::error::{empty_error_response, gateway_error_response, Error, GatewayErrorCode, ProxyBody};
use crate::instance::{Instance, InstanceStatus, ServeGuard};
use crate::ports::PortPool;
use crate::probe::Probe;
use crate::proxy::{GuardedBody, UpstreamClient};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cadence of the updater loop
pub const UPDATE_TICK: Duration = Duration::from_secs(1);

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for the original client address
const X_REAL_IP: &str = "x-real-ip";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Snapshot of one instance for reports and the admin RPC
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub id: u32,
    pub hostname: String,
    pub status: InstanceStatus,
    pub in_flight: usize,
    pub since_secs: u64,
    pub active: bool,
}

/// One supervised application: its instances, its active-instance slot, and
/// its external listener.
///
/// `App` is designed to be used behind an `Arc` shared between the request
/// path, the updater loop, and the admin RPC; [`new`](App::new) returns
/// `Arc<Self>` directly to enforce this.
pub struct App {
    config: Arc<AppConfig>,
    pool: Arc<PortPool>,
    prober: Arc<dyn Probe>,
    client: Arc<UpstreamClient>,
    /// Every instance created for this app, oldest first; terminal instances
    /// are pruned by the updater
    instances: Mutex<Vec<Arc<Instance>>>,
    /// The instance new requests are admitted to. Guarded by a mutex so the
    /// slot read and the in-flight increment happen under one acquisition.
    active: Mutex<Option<Arc<Instance>>>,
    instance_id: AtomicU32,
}

impl App {
    pub fn new(
        config: AppConfig,
        pool: Arc<PortPool>,
        prober: Arc<dyn Probe>,
        client: Arc<UpstreamClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            pool,
            prober,
            client,
            instances: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            instance_id: AtomicU32::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Spawn a fresh instance. Any instance still starting is aborted first;
    /// only one pending startup at a time is meaningful.
    pub fn start_new_instance(&self) -> Result<u32, Error> {
        let starting: Vec<Arc<Instance>> = self
            .instances
            .lock()
            .iter()
            .filter(|i| i.status() == InstanceStatus::Starting)
            .cloned()
            .collect();
        for superseded in starting {
            info!(
                app = %self.config.name,
                instance = superseded.id(),
                "aborting superseded startup"
            );
            superseded.stop();
        }

        let id = self.instance_id.fetch_add(1, Ordering::SeqCst) + 1;
        let instance = Instance::spawn(Arc::clone(&self.config), Arc::clone(&self.pool), id)?;
        self.instances.lock().push(instance);
        Ok(id)
    }

    /// Stop every instance and clear the active slot
    pub fn stop_all(&self) {
        *self.active.lock() = None;
        let snapshot: Vec<Arc<Instance>> = self.instances.lock().clone();
        for instance in snapshot {
            if !instance.status().is_terminal() {
                instance.stop();
            }
        }
    }

    /// True once every instance of this app has reached a terminal status
    pub fn is_drained(&self) -> bool {
        self.instances
            .lock()
            .iter()
            .all(|i| i.status().is_terminal())
    }

    /// Admit one request: read the active slot and count the request into
    /// that instance under the same lock acquisition, so admission is
    /// linearizable with promotion.
    fn reserve_instance(&self) -> Result<(Arc<Instance>, ServeGuard), Error> {
        let slot = self.active.lock();
        let instance = slot.as_ref().ok_or(Error::NoActiveInstance)?;
        instance.serve()?;
        let instance = Arc::clone(instance);
        let guard = ServeGuard::new(Arc::clone(&instance));
        Ok((instance, guard))
    }

    /// Snapshot of all instances for reports and the admin RPC
    pub fn instance_reports(&self) -> Vec<InstanceReport> {
        let active = self.active.lock().clone();
        self.instances
            .lock()
            .iter()
            .map(|instance| InstanceReport {
                id: instance.id(),
                hostname: instance.hostname(),
                status: instance.status(),
                in_flight: instance.in_flight(),
                since_secs: instance.since_secs(),
                active: active
                    .as_ref()
                    .map(|a| Arc::ptr_eq(a, instance))
                    .unwrap_or(false),
            })
            .collect()
    }

    /// One updater pass: drive every instance's state machine, promote a
    /// freshly serving instance, and retire the slot of an exited active.
    pub(crate) async fn update_instances(&self) {
        // Terminal instances stay visible for one report cycle, then go
        self.instances.lock().retain(|i| !i.status().is_terminal());

        let snapshot: Vec<Arc<Instance>> = self.instances.lock().clone();
        for instance in &snapshot {
            let status = instance.update_status(self.prober.as_ref()).await;
            match status {
                InstanceStatus::Serving => {
                    let swapped = {
                        let mut slot = self.active.lock();
                        if matches!(&*slot, Some(active) if Arc::ptr_eq(active, instance)) {
                            None
                        } else {
                            Some(slot.replace(Arc::clone(instance)))
                        }
                    };
                    if let Some(previous) = swapped {
                        info!(
                            app = %self.config.name,
                            instance = instance.id(),
                            port = instance.port(),
                            "instance promoted to active"
                        );
                        // The swap above already bars new admissions to the
                        // previous instance, so stopping it outside the lock
                        // lets it drain down to zero.
                        if let Some(previous) = previous {
                            info!(
                                app = %self.config.name,
                                instance = previous.id(),
                                in_flight = previous.in_flight(),
                                "draining displaced instance"
                            );
                            previous.stop();
                        }
                    }
                }
                InstanceStatus::Exited => {
                    let mut slot = self.active.lock();
                    if matches!(&*slot, Some(active) if Arc::ptr_eq(active, instance)) {
                        warn!(
                            app = %self.config.name,
                            instance = instance.id(),
                            "active instance exited, clearing active slot"
                        );
                        *slot = None;
                    }
                }
                _ => {}
            }
        }
    }

    fn log_report(&self) {
        for report in self.instance_reports() {
            debug!(
                app = %self.config.name,
                instance = report.id,
                hostname = %report.hostname,
                status = %report.status,
                in_flight = report.in_flight,
                since_secs = report.since_secs,
                active = report.active,
                "instance report"
            );
        }
    }

    /// Updater loop: one pass per tick until shutdown
    pub async fn run_updater(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(UPDATE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.update_instances().await;
                    self.log_report();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(app = %self.config.name, "updater stopped");
                        break;
                    }
                }
            }
        }
    }

    /// Serve external traffic on an already-bound listener until shutdown
    pub async fn run_listener(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            app = %self.config.name,
            addr = %self.config.external_addr(),
            "external listener ready"
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let app = Arc::clone(&self);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let app = Arc::clone(&app);
                                    async move { app.handle_request(req, addr).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(app = %self.config.name, error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(app = %self.config.name, "external listener shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_request(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Result<Response<ProxyBody>, hyper::Error> {
        let (instance, guard) = match self.reserve_instance() {
            Ok(pair) => pair,
            Err(e) => {
                debug!(app = %self.config.name, error = %e, "rejecting request");
                return Ok(empty_error_response(GatewayErrorCode::NoActiveInstance));
            }
        };

        // Propagate or mint a request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Overwrite rather than append so clients cannot spoof their
        // address; this proxy is the first trusted hop.
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_REAL_IP, value.clone());
            headers.insert(X_FORWARDED_FOR, value);
        }

        debug!(
            app = %self.config.name,
            instance = instance.id(),
            method = %req.method(),
            uri = %req.uri(),
            request_id,
            "proxying request"
        );

        match self.client.forward(req, &instance.hostname()).await {
            Ok(response) => {
                // The guard rides inside the body: the in-flight count drops
                // when the response finishes streaming, not before.
                let (parts, body) = response.into_parts();
                Ok(Response::from_parts(
                    parts,
                    GuardedBody::new(body, guard).boxed(),
                ))
            }
            Err(e) => {
                error!(
                    app = %self.config.name,
                    instance = instance.id(),
                    error = %e,
                    "upstream request failed"
                );
                Ok(gateway_error_response(
                    GatewayErrorCode::UpstreamFailed,
                    "failed to reach worker instance",
                ))
            }
        }
    }
}
