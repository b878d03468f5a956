//! End-to-end lifecycle tests
//!
//! The supervised command is a plain `sleep`; each test that needs a real
//! worker HTTP surface runs an in-process hyper server on the port the
//! instance reserved. The pool hands ports out lowest-first, so tests know
//! which port each instance will get.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use handover::config::{AppConfig, Config, PortRange, RpcConfig};
use handover::instance::InstanceStatus;
use handover::probe::HttpProbe;
use handover::rpc::RpcServer;
use handover::supervisor::Supervisor;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn make_app(name: &str, command: &str, external_port: u16) -> AppConfig {
    AppConfig {
        name: name.to_string(),
        command: command.to_string(),
        healthcheck: "/health".to_string(),
        stop_signal: "SIGTERM".to_string(),
        max_retries: 30,
        start_timeout_secs: 30,
        stop_timeout_secs: 5,
        internal_host: "127.0.0.1".to_string(),
        external_host: "127.0.0.1".to_string(),
        external_port,
        autostart: false,
    }
}

fn make_config(from: u16, to: u16, apps: Vec<AppConfig>) -> Config {
    Config {
        port_range: PortRange { from, to },
        apps,
        rpc: RpcConfig::default(),
    }
}

/// In-process HTTP server standing in for a worker's surface on `port`.
/// Answers /health with 200, /slow with a 2 s delayed body, and everything
/// else with a body identifying `tag`.
async fn spawn_worker_surface(port: u16, tag: &'static str) {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|e| panic!("failed to bind worker surface on {}: {}", port, e));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                    let body = match req.uri().path() {
                        "/health" => Bytes::from("ok"),
                        "/slow" => {
                            tokio::time::sleep(Duration::from_secs(2)).await;
                            Bytes::from(format!("slow from {}", tag))
                        }
                        _ => Bytes::from(format!("hello from {}", tag)),
                    };
                    Ok::<_, Infallible>(Response::new(Full::new(body)))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });
}

/// Send a simple HTTP request and return the raw response
async fn http_request(port: u16, method: &str, path: &str) -> Result<String, std::io::Error> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

async fn http_get(port: u16, path: &str) -> Result<String, std::io::Error> {
    http_request(port, "GET", path).await
}

/// Poll `predicate` until it holds or `timeout` elapses
async fn wait_for<F: Fn() -> bool>(predicate: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Poll the app's external port until a response body contains `needle`
async fn wait_for_body(port: u16, path: &str, needle: &str, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if let Ok(response) = http_get(port, path).await {
            if response.contains(needle) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn has_active_serving(supervisor: &Supervisor, app: &str) -> bool {
    supervisor
        .status()
        .iter()
        .find(|a| a.name == app)
        .map(|a| {
            a.instances
                .iter()
                .any(|i| i.active && i.status == InstanceStatus::Serving)
        })
        .unwrap_or(false)
}

#[tokio::test]
async fn test_hitless_reload_under_load() {
    let config = make_config(21000, 21009, vec![make_app("web", "sleep 60", 21900)]);
    let supervisor = Supervisor::new(&config, Arc::new(HttpProbe::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handles = supervisor.serve(&shutdown_rx).await.unwrap();

    // First instance gets the lowest port in the range
    spawn_worker_surface(21000, "A").await;
    supervisor.start_instance("web").unwrap();
    assert!(wait_for(|| has_active_serving(&supervisor, "web"), Duration::from_secs(10)).await);
    assert_eq!(supervisor.pool().in_use(), 1);

    let body = http_get(21900, "/").await.unwrap();
    assert!(body.contains("hello from A"), "unexpected body: {}", body);

    // Open long-lived requests that will still be in flight during the swap
    let mut slow = Vec::new();
    for _ in 0..10 {
        slow.push(tokio::spawn(http_get(21900, "/slow")));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Reload: the fresh instance reserves the next port and takes over
    spawn_worker_surface(21001, "B").await;
    supervisor.start_instance("web").unwrap();
    assert!(wait_for_body(21900, "/", "hello from B", Duration::from_secs(15)).await);

    // Every request admitted before the swap completed against the old worker
    for handle in slow {
        let body = handle.await.unwrap().expect("in-flight request failed");
        assert!(body.contains("slow from A"), "unexpected body: {}", body);
    }

    // The displaced instance drains, stops, and returns its port
    assert!(wait_for(|| supervisor.pool().in_use() == 1, Duration::from_secs(10)).await);
    assert!(
        wait_for(
            || {
                let status = supervisor.status();
                let web = &status[0];
                web.instances.len() == 1
                    && web.instances[0].id == 2
                    && web.instances[0].status == InstanceStatus::Serving
            },
            Duration::from_secs(10)
        )
        .await
    );

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_failed_startup_releases_port_and_yields_503() {
    let mut app = make_app("web", "exit 1", 21901);
    app.max_retries = 3;
    app.start_timeout_secs = 5;
    let config = make_config(21020, 21025, vec![app]);
    let supervisor = Supervisor::new(&config, Arc::new(HttpProbe::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handles = supervisor.serve(&shutdown_rx).await.unwrap();

    supervisor.start_instance("web").unwrap();

    let saw_failed = wait_for(
        || {
            supervisor.status()[0]
                .instances
                .iter()
                .any(|i| i.status == InstanceStatus::Failed)
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(saw_failed);

    assert!(wait_for(|| supervisor.pool().in_use() == 0, Duration::from_secs(10)).await);

    let response = http_get(21901, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);
    assert!(response.contains("NO_ACTIVE_INSTANCE"));

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_prior_active_aborted_before_ready() {
    let config = make_config(21030, 21035, vec![make_app("web", "sleep 60", 21902)]);
    let supervisor = Supervisor::new(&config, Arc::new(HttpProbe::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handles = supervisor.serve(&shutdown_rx).await.unwrap();

    // Nothing answers on the first port, so instance 1 never leaves starting
    supervisor.start_instance("web").unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!has_active_serving(&supervisor, "web"));

    // A second start aborts the pending one
    supervisor.start_instance("web").unwrap();
    spawn_worker_surface(21031, "B").await;

    assert!(wait_for(|| has_active_serving(&supervisor, "web"), Duration::from_secs(10)).await);

    let status = supervisor.status();
    let active: Vec<_> = status[0].instances.iter().filter(|i| i.active).collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, 2);

    if let Some(first) = status[0].instances.iter().find(|i| i.id == 1) {
        assert!(matches!(
            first.status,
            InstanceStatus::Stopping | InstanceStatus::Stopped
        ));
    }

    // The aborted instance terminates and frees its port
    assert!(wait_for(|| supervisor.pool().in_use() == 1, Duration::from_secs(10)).await);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_child_crash_while_serving_clears_active() {
    // The worker process dies on its own after two seconds
    let config = make_config(21040, 21045, vec![make_app("web", "sleep 2", 21903)]);
    let supervisor = Supervisor::new(&config, Arc::new(HttpProbe::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handles = supervisor.serve(&shutdown_rx).await.unwrap();

    spawn_worker_surface(21040, "A").await;
    supervisor.start_instance("web").unwrap();
    assert!(wait_for(|| has_active_serving(&supervisor, "web"), Duration::from_secs(10)).await);

    let body = http_get(21903, "/").await.unwrap();
    assert!(body.contains("hello from A"));

    // Child exit surfaces as exited, the active slot is cleared, and
    // requests get 503 until a restart
    let cleared = wait_for(|| !has_active_serving(&supervisor, "web"), Duration::from_secs(10)).await;
    assert!(cleared);
    assert!(wait_for(|| supervisor.pool().in_use() == 0, Duration::from_secs(10)).await);

    let response = http_get(21903, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_force_kill_when_worker_ignores_stop_signal() {
    let mut app = make_app("web", "trap '' TERM; sleep 60", 21904);
    app.stop_timeout_secs = 1;
    let config = make_config(21050, 21055, vec![app]);
    let supervisor = Supervisor::new(&config, Arc::new(HttpProbe::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handles = supervisor.serve(&shutdown_rx).await.unwrap();

    spawn_worker_surface(21050, "A").await;
    supervisor.start_instance("web").unwrap();
    assert!(wait_for(|| has_active_serving(&supervisor, "web"), Duration::from_secs(10)).await);

    // Promote a replacement; the displaced worker ignores SIGTERM and is
    // force-killed after the stop timeout
    spawn_worker_surface(21051, "B").await;
    supervisor.start_instance("web").unwrap();
    assert!(wait_for_body(21904, "/", "hello from B", Duration::from_secs(15)).await);

    assert!(wait_for(|| supervisor.pool().in_use() == 1, Duration::from_secs(15)).await);
    assert!(
        wait_for(
            || {
                let status = supervisor.status();
                status[0].instances.len() == 1 && status[0].instances[0].id == 2
            },
            Duration::from_secs(10)
        )
        .await
    );

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_rpc_surface() {
    let config = make_config(21060, 21065, vec![make_app("web", "sleep 60", 21905)]);
    let supervisor = Supervisor::new(&config, Arc::new(HttpProbe::default()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _handles = supervisor.serve(&shutdown_rx).await.unwrap();

    let rpc = RpcServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::clone(&supervisor),
        shutdown_rx.clone(),
    )
    .await
    .unwrap();
    let rpc_port = rpc.local_addr().unwrap().port();
    tokio::spawn(rpc.run());

    let response = http_get(rpc_port, "/health").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));

    spawn_worker_surface(21060, "A").await;
    let response = http_request(rpc_port, "POST", "/apps/web/start").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.contains("\"instance\":1"));

    assert!(wait_for(|| has_active_serving(&supervisor, "web"), Duration::from_secs(10)).await);

    let response = http_get(rpc_port, "/status").await.unwrap();
    let body = response.split("\r\n\r\n").nth(1).unwrap_or("");
    let status: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(status[0]["name"], "web");
    assert_eq!(status[0]["instances"][0]["status"], "serving");
    assert_eq!(status[0]["instances"][0]["active"], true);

    let response = http_request(rpc_port, "POST", "/apps/nope/start").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"));

    let response = http_request(rpc_port, "POST", "/apps/web/stop").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(wait_for(|| supervisor.pool().in_use() == 0, Duration::from_secs(10)).await);

    let _ = shutdown_tx.send(true);
}
