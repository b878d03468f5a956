//! Worker instance lifecycle
//!
//! An instance owns one spawned child process and one internal port. It runs
//! the state machine starting -> serving -> stopping -> stopped, with failed
//! and exited branches, and tracks the requests currently proxied through it
//! so a displaced instance is only stopped once it has drained.

use crate::config::AppConfig;
use crate::error::Error;
use crate::ports::PortPool;
use crate::probe::Probe;
use parking_lot::Mutex;
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Lifecycle state of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Child spawned, waiting for the health probe to pass
    Starting,
    /// Health probe passed; eligible to receive traffic
    Serving,
    /// Displaced or aborted; draining in-flight requests
    Stopping,
    /// Drained and child reaped
    Stopped,
    /// Never became ready
    Failed,
    /// Child exited on its own while serving
    Exited,
}

impl InstanceStatus {
    /// Terminal statuses are sticky; the port is released when one is entered
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopped | InstanceStatus::Failed | InstanceStatus::Exited
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Starting => write!(f, "starting"),
            InstanceStatus::Serving => write!(f, "serving"),
            InstanceStatus::Stopping => write!(f, "stopping"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Exited => write!(f, "exited"),
        }
    }
}

struct State {
    status: InstanceStatus,
    last_change: Instant,
    /// Present until the child is reaped or handed to a detached reaper
    child: Option<Child>,
    probe_failures: u32,
    /// Graceful stop signal already delivered
    signaled: bool,
}

/// One worker instance: a child process bound to one internal port
pub struct Instance {
    id: u32,
    port: u16,
    config: Arc<AppConfig>,
    pool: Arc<PortPool>,
    in_flight: AtomicUsize,
    state: Mutex<State>,
    started_at: Instant,
}

impl Instance {
    /// Reserve a port and spawn the worker command with PORT set to it.
    ///
    /// On spawn failure the port is released before the error is returned.
    pub fn spawn(config: Arc<AppConfig>, pool: Arc<PortPool>, id: u32) -> Result<Arc<Self>, Error> {
        let port = pool.reserve()?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&config.command)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                pool.release(port);
                return Err(Error::Spawn(e));
            }
        };

        info!(
            app = %config.name,
            instance = id,
            port,
            pid = child.id().unwrap_or(0),
            "worker spawned"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(stream_output(config.name.clone(), id, stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(stream_output(config.name.clone(), id, stderr, true));
        }

        Ok(Arc::new(Self {
            id,
            port,
            config,
            pool,
            in_flight: AtomicUsize::new(0),
            state: Mutex::new(State {
                status: InstanceStatus::Starting,
                last_change: Instant::now(),
                child: Some(child),
                probe_failures: 0,
                signaled: false,
            }),
            started_at: Instant::now(),
        }))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Internal host:port the worker is probed and proxied on
    pub fn hostname(&self) -> String {
        format!("{}:{}", self.config.internal_host, self.port)
    }

    pub fn status(&self) -> InstanceStatus {
        self.state.lock().status
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whole seconds since the last status change
    pub fn since_secs(&self) -> u64 {
        self.state.lock().last_change.elapsed().as_secs()
    }

    /// Admit one request to this instance.
    ///
    /// Must be called while holding the owning app's active-instance lock so
    /// admission is linearizable with promotion. Fails fast when the instance
    /// is not serving.
    pub fn serve(&self) -> Result<(), Error> {
        let state = self.state.lock();
        if state.status != InstanceStatus::Serving {
            return Err(Error::NotServing);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Complete one request admitted with [`serve`](Self::serve).
    ///
    /// When the instance is draining and this was the last in-flight request,
    /// the deferred stop signal is delivered to the child.
    pub fn done(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "done() called without matching serve()");
        if prev == 1 {
            let mut state = self.state.lock();
            if state.status == InstanceStatus::Stopping {
                self.signal_child(&mut state);
            }
        }
    }

    /// Begin stopping this instance. Idempotent.
    ///
    /// The stop signal is sent immediately when nothing is in flight,
    /// otherwise deferred until the last [`done`](Self::done). The stop
    /// timeout is armed either way; on expiry the child is force-killed.
    pub fn stop(self: &Arc<Self>) {
        let mut state = self.state.lock();
        match state.status {
            InstanceStatus::Starting | InstanceStatus::Serving => {
                self.transition(&mut state, InstanceStatus::Stopping);
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    self.signal_child(&mut state);
                }

                let instance = Arc::clone(self);
                let stop_timeout = self.config.stop_timeout();
                tokio::spawn(async move {
                    tokio::time::sleep(stop_timeout).await;
                    instance.force_kill();
                });
            }
            _ => {}
        }
    }

    /// Drive the state machine one step and return the current status.
    ///
    /// Called once per updater tick. Reaps the child on exit, enforces the
    /// start timeout, probes during startup, and completes the stop once the
    /// instance has drained. Terminal statuses are sticky.
    pub async fn update_status(&self, probe: &dyn Probe) -> InstanceStatus {
        let status = self.check_process();
        if status != InstanceStatus::Starting {
            return status;
        }

        let healthy = probe
            .probe(&self.hostname(), &self.config.healthcheck)
            .await;
        self.apply_probe(healthy)
    }

    /// Child and timeout bookkeeping that needs no probe I/O
    fn check_process(&self) -> InstanceStatus {
        let mut state = self.state.lock();
        match state.status {
            InstanceStatus::Starting => {
                if let Some(exit) = Self::reap(&mut state) {
                    warn!(
                        app = %self.config.name,
                        instance = self.id,
                        code = ?exit.code(),
                        "worker exited before becoming ready"
                    );
                    self.transition(&mut state, InstanceStatus::Failed);
                } else if self.started_at.elapsed() >= self.config.start_timeout() {
                    warn!(
                        app = %self.config.name,
                        instance = self.id,
                        timeout_secs = self.config.start_timeout_secs,
                        "worker did not become ready in time"
                    );
                    Self::abort_child(&mut state);
                    self.transition(&mut state, InstanceStatus::Failed);
                }
            }
            InstanceStatus::Serving => {
                if let Some(exit) = Self::reap(&mut state) {
                    warn!(
                        app = %self.config.name,
                        instance = self.id,
                        code = ?exit.code(),
                        "worker exited unexpectedly"
                    );
                    self.transition(&mut state, InstanceStatus::Exited);
                }
            }
            InstanceStatus::Stopping => {
                if let Some(exit) = Self::reap(&mut state) {
                    debug!(
                        app = %self.config.name,
                        instance = self.id,
                        code = ?exit.code(),
                        "worker exited while stopping"
                    );
                }
                if state.child.is_none() && self.in_flight.load(Ordering::SeqCst) == 0 {
                    self.transition(&mut state, InstanceStatus::Stopped);
                }
            }
            _ => {}
        }
        state.status
    }

    /// Apply one probe result taken during startup
    fn apply_probe(&self, healthy: bool) -> InstanceStatus {
        let mut state = self.state.lock();
        if state.status != InstanceStatus::Starting {
            return state.status;
        }

        if healthy {
            self.transition(&mut state, InstanceStatus::Serving);
        } else {
            state.probe_failures += 1;
            debug!(
                app = %self.config.name,
                instance = self.id,
                failures = state.probe_failures,
                max_retries = self.config.max_retries,
                "health probe failed"
            );
            if state.probe_failures > self.config.max_retries {
                warn!(
                    app = %self.config.name,
                    instance = self.id,
                    "health probe retries exhausted"
                );
                Self::abort_child(&mut state);
                self.transition(&mut state, InstanceStatus::Failed);
            }
        }
        state.status
    }

    fn transition(&self, state: &mut State, to: InstanceStatus) {
        let from = state.status;
        if from == to {
            return;
        }
        info!(
            app = %self.config.name,
            instance = self.id,
            %from,
            %to,
            "instance status change"
        );
        state.status = to;
        state.last_change = Instant::now();
        if to.is_terminal() {
            self.pool.release(self.port);
        }
    }

    /// Deliver the configured stop signal, at most once
    fn signal_child(&self, state: &mut State) {
        if state.signaled {
            return;
        }
        state.signaled = true;

        if let Some(child) = state.child.as_mut() {
            if let Some(pid) = child.id() {
                debug!(
                    app = %self.config.name,
                    instance = self.id,
                    pid,
                    signal = %self.config.stop_signal,
                    "sending stop signal"
                );
                #[cfg(unix)]
                unsafe {
                    libc::kill(pid as i32, self.config.stop_signal_code());
                }
                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }
        }
    }

    /// Kill the child if the instance is still draining when the stop
    /// timeout fires
    fn force_kill(&self) {
        let mut state = self.state.lock();
        if state.status != InstanceStatus::Stopping {
            return;
        }
        if let Some(child) = state.child.as_mut() {
            warn!(
                app = %self.config.name,
                instance = self.id,
                "stop timeout elapsed, force-killing worker"
            );
            let _ = child.start_kill();
        }
    }

    /// Reap the child if it has exited
    fn reap(state: &mut State) -> Option<std::process::ExitStatus> {
        let child = state.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(exit)) => {
                state.child = None;
                Some(exit)
            }
            _ => None,
        }
    }

    /// Kill a child that will never serve and reap it off-path
    fn abort_child(state: &mut State) {
        if let Some(mut child) = state.child.take() {
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
    }
}

/// Guard pairing one `serve()` with exactly one `done()`, on every exit path
pub struct ServeGuard {
    instance: Arc<Instance>,
}

impl ServeGuard {
    pub fn new(instance: Arc<Instance>) -> Self {
        Self { instance }
    }
}

impl Drop for ServeGuard {
    fn drop(&mut self) {
        self.instance.done();
    }
}

/// Forward worker output lines into the supervisor's log
async fn stream_output<R>(app: String, instance: u32, reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            warn!(app = %app, instance, "{}", line);
        } else {
            info!(app = %app, instance, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use std::time::Duration;

    struct StaticProbe(bool);

    impl Probe for StaticProbe {
        fn probe<'a>(&'a self, _: &'a str, _: &'a str) -> BoxFuture<'a, bool> {
            let healthy = self.0;
            Box::pin(async move { healthy })
        }
    }

    fn test_config(command: &str) -> AppConfig {
        AppConfig {
            name: "test".to_string(),
            command: command.to_string(),
            healthcheck: "/health".to_string(),
            stop_signal: "SIGTERM".to_string(),
            max_retries: 3,
            start_timeout_secs: 5,
            stop_timeout_secs: 5,
            internal_host: "127.0.0.1".to_string(),
            external_host: "127.0.0.1".to_string(),
            external_port: 1,
            autostart: true,
        }
    }

    async fn wait_for_status(
        instance: &Arc<Instance>,
        probe: &dyn Probe,
        expected: InstanceStatus,
        timeout: Duration,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if instance.update_status(probe).await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_lifecycle_to_serving_and_graceful_stop() {
        let pool = Arc::new(PortPool::new(25000, 25001));
        let instance =
            Instance::spawn(Arc::new(test_config("sleep 60")), Arc::clone(&pool), 1).unwrap();

        assert_eq!(instance.status(), InstanceStatus::Starting);
        assert_eq!(pool.available(), 1);

        // Not admitting traffic before the probe passes
        assert!(matches!(instance.serve(), Err(Error::NotServing)));

        let status = instance.update_status(&StaticProbe(true)).await;
        assert_eq!(status, InstanceStatus::Serving);

        instance.serve().unwrap();
        assert_eq!(instance.in_flight(), 1);
        instance.done();
        assert_eq!(instance.in_flight(), 0);

        instance.stop();
        assert!(
            wait_for_status(
                &instance,
                &StaticProbe(true),
                InstanceStatus::Stopped,
                Duration::from_secs(3)
            )
            .await
        );
        assert_eq!(instance.in_flight(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let pool = Arc::new(PortPool::new(25010, 25011));
        let instance =
            Instance::spawn(Arc::new(test_config("sleep 60")), Arc::clone(&pool), 1).unwrap();

        instance.update_status(&StaticProbe(true)).await;
        instance.stop();
        instance.stop();
        instance.stop();

        assert!(
            wait_for_status(
                &instance,
                &StaticProbe(true),
                InstanceStatus::Stopped,
                Duration::from_secs(3)
            )
            .await
        );
        // A double port release would trip the pool's debug assertion
        assert_eq!(pool.available(), 2);

        // Terminal status is sticky
        instance.stop();
        assert_eq!(instance.status(), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_child_exit_before_ready_fails() {
        let pool = Arc::new(PortPool::new(25020, 25021));
        let instance =
            Instance::spawn(Arc::new(test_config("exit 1")), Arc::clone(&pool), 1).unwrap();

        assert!(
            wait_for_status(
                &instance,
                &StaticProbe(false),
                InstanceStatus::Failed,
                Duration::from_secs(3)
            )
            .await
        );
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_on_first_probe_failure() {
        let pool = Arc::new(PortPool::new(25030, 25031));
        let mut config = test_config("sleep 60");
        config.max_retries = 0;
        let instance = Instance::spawn(Arc::new(config), Arc::clone(&pool), 1).unwrap();

        let status = instance.update_status(&StaticProbe(false)).await;
        assert_eq!(status, InstanceStatus::Failed);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_start_timeout_fails_instance() {
        let pool = Arc::new(PortPool::new(25040, 25041));
        let mut config = test_config("sleep 60");
        config.start_timeout_secs = 0;
        let instance = Instance::spawn(Arc::new(config), Arc::clone(&pool), 1).unwrap();

        let status = instance.update_status(&StaticProbe(true)).await;
        assert_eq!(status, InstanceStatus::Failed);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_force_kill_when_stop_signal_ignored() {
        let pool = Arc::new(PortPool::new(25050, 25051));
        let mut config = test_config("trap '' TERM; sleep 60");
        config.stop_timeout_secs = 1;
        let instance = Instance::spawn(Arc::new(config), Arc::clone(&pool), 1).unwrap();

        let status = instance.update_status(&StaticProbe(true)).await;
        assert_eq!(status, InstanceStatus::Serving);

        instance.stop();
        assert!(
            wait_for_status(
                &instance,
                &StaticProbe(true),
                InstanceStatus::Stopped,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_drain_defers_stop_signal() {
        let pool = Arc::new(PortPool::new(25060, 25061));
        let instance =
            Instance::spawn(Arc::new(test_config("sleep 60")), Arc::clone(&pool), 1).unwrap();

        instance.update_status(&StaticProbe(true)).await;
        instance.serve().unwrap();

        instance.stop();
        assert_eq!(instance.status(), InstanceStatus::Stopping);

        // Request still in flight: the signal is withheld and the child lives
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            instance.update_status(&StaticProbe(true)).await,
            InstanceStatus::Stopping
        );

        // No new admissions while draining
        assert!(matches!(instance.serve(), Err(Error::NotServing)));

        instance.done();
        assert!(
            wait_for_status(
                &instance,
                &StaticProbe(true),
                InstanceStatus::Stopped,
                Duration::from_secs(3)
            )
            .await
        );
        assert_eq!(instance.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_exited_when_child_dies_while_serving() {
        let pool = Arc::new(PortPool::new(25070, 25071));
        let instance =
            Instance::spawn(Arc::new(test_config("sleep 1")), Arc::clone(&pool), 1).unwrap();

        let status = instance.update_status(&StaticProbe(true)).await;
        assert_eq!(status, InstanceStatus::Serving);

        assert!(
            wait_for_status(
                &instance,
                &StaticProbe(true),
                InstanceStatus::Exited,
                Duration::from_secs(5)
            )
            .await
        );
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(InstanceStatus::Starting.to_string(), "starting");
        assert_eq!(InstanceStatus::Serving.to_string(), "serving");
        assert_eq!(InstanceStatus::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(InstanceStatus::Stopped.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Exited.is_terminal());
        assert!(!InstanceStatus::Starting.is_terminal());
        assert!(!InstanceStatus::Serving.is_terminal());
        assert!(!InstanceStatus::Stopping.is_terminal());
    }
}
