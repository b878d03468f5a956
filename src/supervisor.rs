//! Supervisor: the set of apps over one shared port pool

use crate::app::{App, InstanceReport};
use crate::config::Config;
use crate::error::Error;
use crate::ports::PortPool;
use crate::probe::Probe;
use crate::proxy::UpstreamClient;
use anyhow::Context;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Snapshot of one app for reports and the admin RPC
#[derive(Debug, Clone, Serialize)]
pub struct AppReport {
    pub name: String,
    pub external: String,
    pub instances: Vec<InstanceReport>,
}

/// Owns every configured [`App`] and the port pool they share
pub struct Supervisor {
    apps: HashMap<String, Arc<App>>,
    pool: Arc<PortPool>,
}

impl Supervisor {
    pub fn new(config: &Config, prober: Arc<dyn Probe>) -> Arc<Self> {
        let pool = Arc::new(PortPool::new(config.port_range.from, config.port_range.to));
        let client = Arc::new(UpstreamClient::new());

        let apps = config
            .apps
            .iter()
            .map(|app_config| {
                (
                    app_config.name.clone(),
                    App::new(
                        app_config.clone(),
                        Arc::clone(&pool),
                        Arc::clone(&prober),
                        Arc::clone(&client),
                    ),
                )
            })
            .collect();

        Arc::new(Self { apps, pool })
    }

    pub fn pool(&self) -> &Arc<PortPool> {
        &self.pool
    }

    pub fn app(&self, name: &str) -> Option<&Arc<App>> {
        self.apps.get(name)
    }

    pub fn apps(&self) -> impl Iterator<Item = &Arc<App>> {
        self.apps.values()
    }

    /// Spawn a fresh instance for the named app
    pub fn start_instance(&self, name: &str) -> Result<u32, Error> {
        self.apps
            .get(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?
            .start_new_instance()
    }

    /// Stop every instance of the named app
    pub fn stop_app(&self, name: &str) -> Result<(), Error> {
        self.apps
            .get(name)
            .ok_or_else(|| Error::UnknownApp(name.to_string()))?
            .stop_all();
        Ok(())
    }

    /// Snapshot of all apps and their instances, sorted by app name
    pub fn status(&self) -> Vec<AppReport> {
        let mut reports: Vec<AppReport> = self
            .apps
            .values()
            .map(|app| AppReport {
                name: app.name().to_string(),
                external: app.config().external_addr(),
                instances: app.instance_reports(),
            })
            .collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Start one instance for every app configured to autostart
    pub fn bootstrap(&self) {
        for app in self.apps.values() {
            if !app.config().autostart {
                continue;
            }
            match app.start_new_instance() {
                Ok(id) => info!(app = %app.name(), instance = id, "bootstrap instance started"),
                Err(e) => error!(app = %app.name(), error = %e, "failed to start bootstrap instance"),
            }
        }
    }

    /// Bind every app's external listener and spawn its listener and updater
    /// loops. Bind failures are fatal.
    pub async fn serve(
        self: &Arc<Self>,
        shutdown_rx: &watch::Receiver<bool>,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        for app in self.apps.values() {
            let addr = app.config().external_addr();
            let listener = TcpListener::bind(addr.as_str())
                .await
                .with_context(|| format!("failed to bind {} for app '{}'", addr, app.name()))?;

            handles.push(tokio::spawn(
                Arc::clone(app).run_listener(listener, shutdown_rx.clone()),
            ));
            handles.push(tokio::spawn(
                Arc::clone(app).run_updater(shutdown_rx.clone()),
            ));
        }
        Ok(handles)
    }

    /// Stop every instance and wait until all reach a terminal status, or
    /// the hard timeout elapses. The updater loops must still be running for
    /// instances to drain and be reaped.
    pub async fn shutdown(&self, wait: Duration) {
        info!("stopping all apps");
        for app in self.apps.values() {
            app.stop_all();
        }

        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if self.apps.values().all(|app| app.is_drained()) {
                info!("all instances stopped");
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!("shutdown wait timed out with instances still running");
    }
}
