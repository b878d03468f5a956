//! Control CLI for the handover admin RPC
//!
//! Usage:
//!   handoverctl [--rpc HOST:PORT] status
//!   handoverctl [--rpc HOST:PORT] start <app>
//!   handoverctl [--rpc HOST:PORT] stop <app>

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

const DEFAULT_RPC_ADDR: &str = "127.0.0.1:9700";

fn usage() -> ! {
    eprintln!("usage: handoverctl [--rpc HOST:PORT] <status | start APP | stop APP>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut rpc_addr = DEFAULT_RPC_ADDR.to_string();
    if args.first().map(String::as_str) == Some("--rpc") {
        if args.len() < 2 {
            usage();
        }
        rpc_addr = args[1].clone();
        args.drain(0..2);
    }

    let (method, path) = match args.iter().map(String::as_str).collect::<Vec<_>>()[..] {
        ["status"] => (Method::GET, "/status".to_string()),
        ["start", app] => (Method::POST, format!("/apps/{}/start", app)),
        ["stop", app] => (Method::POST, format!("/apps/{}/stop", app)),
        _ => usage(),
    };

    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(HttpConnector::new());

    let uri: hyper::Uri = format!("http://{}{}", rpc_addr, path).parse()?;
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Empty::new())?;

    let response = client
        .request(req)
        .await
        .map_err(|e| anyhow::anyhow!("rpc request to {} failed: {}", rpc_addr, e))?;

    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    let text = String::from_utf8_lossy(&body);

    // Pretty-print JSON payloads, pass everything else through
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", text),
    }

    if !status.is_success() {
        eprintln!("rpc returned {}", status);
        std::process::exit(1);
    }

    Ok(())
}
