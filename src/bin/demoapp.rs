//! Minimal demo worker for exercising the supervisor
//!
//! Binds the port given in the PORT environment variable and answers every
//! request with a body identifying that port, so a hitless reload is visible
//! from the outside. Serves /health for the supervisor's probe.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    println!("demoapp listening on port {}", port);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                let body = match req.uri().path() {
                    "/health" => Bytes::from("ok"),
                    _ => Bytes::from(format!("Hello from {}\n", port)),
                };
                Ok::<_, Infallible>(Response::new(Full::new(body)))
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("connection error: {}", e);
            }
        });
    }
}
