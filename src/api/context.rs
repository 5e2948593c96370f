use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use log::{debug, error, warn};
use uuid::Uuid;

use super::routes::state::{blocking, AppState};
use crate::activity::{self, ActionType, Client};
use crate::db::Database;
use crate::error::{codes, ErrorResponse, MapMarkError};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request values shared by the visit log, the action log and the
/// handlers' log lines. Built once by `track_visit` and read back by
/// handlers through the extractor.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub client: Client,
    pub path: String,
    pub referer: String,
}

impl RequestContext {
    pub fn new(headers: &HeaderMap, peer: Option<SocketAddr>, path: &str) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            client: Client {
                ip: client_ip(headers, peer),
                user_agent: header_str(headers, header::USER_AGENT.as_str()),
            },
            path: path.to_string(),
            referer: header_str(headers, header::REFERER.as_str()),
        }
    }

    /// Appends a UserAction row. Failures are logged and never reach the
    /// caller: the mutation they describe has already succeeded.
    pub async fn record_action(&self, db: &Database, action: ActionType, detail: String, target_id: String) {
        let db = db.clone();
        let client = self.client.clone();
        let result =
            blocking(move || activity::record_action(&db, &client, action, &detail, &target_id)).await;

        if let Err(e) = result {
            error!(
                "[{}] Failed to record {} action from {}: {}",
                self.request_id,
                action.as_str(),
                self.client.ip,
                e
            );
        }
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = MapMarkError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or_else(|| MapMarkError::Error("Request context missing".to_string()))
    }
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Middleware: builds the `RequestContext`, records the visit and tags the
/// response with the request id.
pub async fn track_visit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ctx = RequestContext::new(request.headers(), peer, request.uri().path());
    request.extensions_mut().insert(ctx.clone());

    debug!(
        "[{}] {} {} from {}",
        ctx.request_id,
        request.method(),
        ctx.path,
        ctx.client.ip
    );

    let db = state.db.clone();
    let visit = ctx.clone();
    let result =
        blocking(move || activity::record_visit(&db, &visit.client, &visit.path, &visit.referer)).await;
    if let Err(e) = result {
        error!(
            "[{}] Failed to record visit from {}: {}",
            ctx.request_id, ctx.client.ip, e
        );
    }

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Middleware: answers 408 when the handler does not finish in time. The
/// handler future is dropped, so it only wraps routes that never write.
pub async fn enforce_timeout(State(timeout): State<Duration>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();

    match tokio::time::timeout(timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            warn!("Request to {} timed out after {:?}", path, timeout);
            let body = ErrorResponse {
                error: "Request timed out".to_string(),
                code: codes::INTERNAL,
            };
            (StatusCode::REQUEST_TIMEOUT, Json(body)).into_response()
        }
    }
}
