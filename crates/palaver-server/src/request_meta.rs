//! Request metadata extraction.
//!
//! Runs outermost: resolves the client IP (proxy headers first), captures the
//! user agent, and accepts or generates an `X-Request-Id`. The metadata is
//! stored in request extensions for handlers and downstream middleware, and
//! the request id is echoed on the response.

use std::net::IpAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use palaver_shared::RequestMetadata;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub async fn request_metadata_middleware(mut req: Request<Body>, next: Next) -> Response {
    let ip_address = extract_client_ip(&req)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let user_agent = req
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let meta = RequestMetadata::new(ip_address, user_agent, Some(request_id));
    req.extensions_mut().insert(meta.clone());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&meta.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
pub fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(forwarded) = req.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    None
}
