//! # Http module
//!
//! This module provide the health and telemetry endpoint exposed by the
//! operator

use std::convert::Infallible;

use hyper::{header, Body, Method, Request, Response, StatusCode};
#[cfg(feature = "metrics")]
use prometheus::{Encoder, TextEncoder};
use tracing::debug;

// -----------------------------------------------------------------------------
// Handlers

fn healthz() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("ok"))
        .unwrap_or_default()
}

#[cfg(feature = "metrics")]
fn metrics() -> Response<Body> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();

    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from(err.to_string()))
            .unwrap_or_default();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .unwrap_or_default()
}

fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())
        .unwrap_or_default()
}

// -----------------------------------------------------------------------------
// Router

/// dispatches the incoming request on the health and telemetry handlers
pub async fn router(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    debug!(
        method = req.method().to_string(),
        path = req.uri().path(),
        "Received http request"
    );

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => healthz(),
        #[cfg(feature = "metrics")]
        (&Method::GET, "/metrics") => metrics(),
        _ => not_found(),
    };

    Ok(response)
}
