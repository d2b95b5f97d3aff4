//! Proxy error mapping and response helpers

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Request-scoped proxy failures mapped to HTTP statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyError {
    /// No app is configured for the request host
    DomainNotFound,
    /// The app exists but its process is not running
    ServiceUnavailable,
    /// The upstream round trip failed
    BadGateway,
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::DomainNotFound => StatusCode::NOT_FOUND,
            ProxyError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BadGateway => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn body(&self) -> &'static str {
        match self {
            ProxyError::DomainNotFound => "Domain not found",
            ProxyError::ServiceUnavailable => "Service Unavailable",
            ProxyError::BadGateway => "Bad Gateway",
        }
    }

    pub fn response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        text_response(self.status_code(), self.body())
    }
}

/// Plain-text response - infallible with valid StatusCode and static headers
pub fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
