//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Middleware that logs HTTP requests with timing information.
///
/// Each request runs inside an `http_request` span carrying a request id, which is also echoed
/// back in the `x-request-id` response header. 5xx responses log at WARN so gate outages
/// (timeouts, cache failures) stand out from ordinary rejections.
pub async fn request_logging(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().to_string();

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
        client_ip = %addr.ip(),
    );

    let start = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let _entered = span.enter();
    if status >= 500 {
        warn!(status, latency_ms, "Request failed (5xx)");
    } else if status >= 400 {
        info!(status, latency_ms, "Request rejected (4xx)");
    } else {
        info!(status, latency_ms, "Request completed");
    }

    response
}
