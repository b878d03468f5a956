//! Upstream side of the reverse proxy
//!
//! A pooled hyper client forwards admitted requests to the active instance's
//! internal host:port. The response body is wrapped so the instance's
//! in-flight count is decremented only once the response has fully streamed
//! back (or the client went away), never earlier and never twice.

use crate::error::ProxyBody;
use crate::instance::ServeGuard;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

/// Error type for upstream forwarding
#[derive(Debug)]
pub enum ProxyError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building the upstream request
    RequestBuild(String),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Client(e) => write!(f, "upstream client error: {}", e),
            ProxyError::RequestBuild(s) => write!(f, "request build error: {}", s),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<hyper_util::client::legacy::Error> for ProxyError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        ProxyError::Client(err)
    }
}

/// Pooled HTTP client shared by all apps for worker-bound traffic
pub struct UpstreamClient {
    client: Client<HttpConnector, Incoming>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Self { client }
    }

    /// Forward a request to the worker at `authority`, streaming both ways
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        authority: &str,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let uri = format!(
            "http://{}{}",
            authority,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| ProxyError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Response body that releases its serve guard when it is fully streamed
/// or dropped, whichever comes first
pub struct GuardedBody {
    inner: ProxyBody,
    _guard: ServeGuard,
}

impl GuardedBody {
    pub fn new(inner: ProxyBody, guard: ServeGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
