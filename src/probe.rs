//! Health probing for starting instances
//!
//! Probing is a separate concept from the instance itself so the lifecycle
//! can be driven by a deterministic prober in tests.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// One-shot health probe against a worker instance
pub trait Probe: Send + Sync {
    /// Probe `authority` (host:port) once at `path`; true means the worker
    /// answered with a 2xx status.
    fn probe<'a>(&'a self, authority: &'a str, path: &'a str) -> BoxFuture<'a, bool>;
}

/// HTTP GET prober used in production
pub struct HttpProbe {
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        // Probes run once per updater tick; the deadline must stay under it.
        Self::new(Duration::from_millis(900))
    }
}

impl Probe for HttpProbe {
    fn probe<'a>(&'a self, authority: &'a str, path: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let connect = tokio::time::timeout(self.timeout, TcpStream::connect(authority)).await;

            let mut stream = match connect {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    debug!(authority, error = %e, "health probe connect failed");
                    return false;
                }
                Err(_) => {
                    debug!(authority, "health probe connect timed out");
                    return false;
                }
            };

            let request = format!(
                "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                path, authority
            );

            if stream.write_all(request.as_bytes()).await.is_err() {
                return false;
            }

            let read_result = tokio::time::timeout(self.timeout, async {
                let mut reader = BufReader::new(stream);
                let mut status_line = String::new();
                reader.read_line(&mut status_line).await?;
                Ok::<_, std::io::Error>(status_line)
            })
            .await;

            match read_result {
                Ok(Ok(status_line)) => {
                    // Format: "HTTP/1.1 200 OK\r\n"
                    status_line
                        .split_whitespace()
                        .nth(1)
                        .and_then(|code| code.parse::<u16>().ok())
                        .map(|code| (200..300).contains(&code))
                        .unwrap_or(false)
                }
                _ => false,
            }
        })
    }
}
