//! Domain errors and gateway error responses

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type used on the proxying path
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Errors surfaced to operators and callers of supervisor operations
#[derive(Debug)]
pub enum Error {
    /// The shared port pool has no free ports left
    PortsExhausted,
    /// The app has no instance in serving state to admit a request to
    NoActiveInstance,
    /// The instance left serving state before the request could be admitted
    NotServing,
    /// No app with this name is configured
    UnknownApp(String),
    /// The configuration failed validation
    InvalidConfig(String),
    /// Spawning the worker child process failed
    Spawn(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::PortsExhausted => write!(f, "no free ports left in the port pool"),
            Error::NoActiveInstance => write!(f, "no active instance"),
            Error::NotServing => write!(f, "instance is not serving"),
            Error::UnknownApp(name) => write!(f, "unknown app: {}", name),
            Error::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            Error::Spawn(e) => write!(f, "failed to spawn worker: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Error codes attached to responses generated by the proxy itself
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// No instance of the app is currently serving
    NoActiveInstance,
    /// The active instance could not be reached or failed mid-response
    UpstreamFailed,
}

impl GatewayErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::NoActiveInstance => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::UpstreamFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::NoActiveInstance => "NO_ACTIVE_INSTANCE",
            GatewayErrorCode::UpstreamFailed => "UPSTREAM_FAILED",
        }
    }
}

/// JSON body for gateway-generated error responses
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: GatewayErrorCode,
    message: String,
    status: u16,
}

/// Empty-bodied response for conditions where the contract requires no body,
/// still tagged with X-Proxy-Error so clients can tell the proxy generated it.
pub fn empty_error_response(code: GatewayErrorCode) -> Response<ProxyBody> {
    Response::builder()
        .status(code.status_code())
        .header("X-Proxy-Error", code.as_header_value())
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// JSON error response with X-Proxy-Error header
pub fn gateway_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let status = code.status_code();
    let body = ErrorBody {
        code,
        message: message.into(),
        status: status.as_u16(),
    };
    let body = serde_json::to_string(&body).unwrap_or_else(|_| {
        format!(
            r#"{{"code":"{}","status":{}}}"#,
            code.as_header_value(),
            status.as_u16()
        )
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
