//! axum middleware adapter.
//!
//! Bridges the HTTP layer to the admission engine: builds a
//! `RequestDescriptor` from the inbound request, invokes the engine once
//! before the protected handler runs, and either forwards the request
//! (attaching any informational headers to the response) or
//! short-circuits with the engine's rejection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tracing::warn;

use crate::limit::{AdmissionEngine, Decision, RequestDescriptor};

/// Caller identity resolved by an upstream auth layer and stashed in the
/// request extensions before the admission middleware runs.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub role: Option<String>,
    pub id: Option<String>,
}

/// Admission middleware for `axum::middleware::from_fn_with_state`.
///
/// ```ignore
/// let engine = Arc::new(AdmissionEngine::from_config(config).await?);
/// let app = Router::new()
///     .route("/quotes", get(list_quotes))
///     .layer(middleware::from_fn_with_state(engine, admission_middleware));
/// ```
pub async fn admission_middleware(
    State(engine): State<Arc<AdmissionEngine>>,
    request: Request,
    next: Next,
) -> Response {
    let descriptor = describe(&request);
    match engine.check(&descriptor).await {
        Decision::Admit { headers } => {
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &headers);
            response
        }
        Decision::Skip { .. } => next.run(request).await,
        Decision::Reject(rejection) => {
            let status = StatusCode::from_u16(rejection.status)
                .unwrap_or(StatusCode::TOO_MANY_REQUESTS);
            let mut response = (status, Json(rejection.body)).into_response();
            apply_headers(response.headers_mut(), &rejection.headers);
            response
        }
    }
}

/// Build the engine's request descriptor from an axum request.
fn describe(request: &Request) -> RequestDescriptor {
    let peer_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let caller = request.extensions().get::<CallerIdentity>();

    RequestDescriptor {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        headers: request.headers().clone(),
        peer_addr,
        role: caller.and_then(|c| c.role.clone()),
        id: caller.and_then(|c| c.id.clone()),
    }
}

/// Apply engine-composed headers, dropping any that are not valid HTTP.
fn apply_headers(map: &mut HeaderMap, headers: &[(String, String)]) {
    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "Skipping invalid rate limit header name");
            continue;
        };
        match HeaderValue::from_str(value) {
            Ok(value) => {
                map.insert(name, value);
            }
            Err(_) => warn!(header = %name, "Skipping invalid rate limit header value"),
        }
    }
}
