use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::protocol::{CHAT_COMPLETIONS_PATH, TARGET_SERVICE_HEADER};
use shared::types::ServiceRecord;
use crate::config::ClientAccess;
use crate::registry::ServiceRegistry;
use crate::relay::{RelayError, RequestRelay};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub relay: Arc<RequestRelay>,
    pub client_access: ClientAccess,
}

/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// access check needs the peer address.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(CHAT_COMPLETIONS_PATH, post(chat_completions))
        .route("/v1/services", get(get_services))
        .route("/v1/services/:name", get(get_service))
        .route_layer(middleware::from_fn_with_state(state.clone(), client_access))
        .with_state(state)
}

async fn client_access(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    if !peer_allowed(state.client_access, peer) {
        tracing::warn!(peer = ?peer, "Rejected non-loopback client");
        return error_response(StatusCode::FORBIDDEN, "forbidden", "relay only accepts loopback clients");
    }

    next.run(request).await
}

fn peer_allowed(access: ClientAccess, peer: Option<SocketAddr>) -> bool {
    match access {
        ClientAccess::Open => true,
        ClientAccess::Loopback => peer.is_some_and(|addr| addr.ip().is_loopback()),
    }
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    // A present but unusable header is an error, never a fallback to another service
    let requested = match headers.get(TARGET_SERVICE_HEADER) {
        Some(value) => {
            let name = value.to_str().map_err(|_| RelayError::InvalidTarget)?.trim();
            if name.is_empty() {
                return Err(RelayError::InvalidTarget);
            }
            Some(name)
        }
        None => None,
    };

    let target = state.relay.select_target(requested)?;
    let upstream = state.relay.handle(body, &target).await?;

    let mut response = (upstream.status, upstream.body).into_response();
    match upstream.content_type {
        Some(content_type) => {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        None => {
            response.headers_mut().remove(header::CONTENT_TYPE);
        }
    }
    Ok(response)
}

async fn get_services(State(state): State<AppState>) -> Json<Vec<ServiceRecord>> {
    Json(state.registry.records())
}

async fn get_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceRecord>, StatusCode> {
    state
        .registry
        .get(&name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// OpenAI-style error body so chat clients can surface the message
fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message,
                "type": kind,
            }
        })),
    )
        .into_response()
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            RelayError::InvalidTarget => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            RelayError::NoServices => (StatusCode::SERVICE_UNAVAILABLE, "no_services"),
            RelayError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable"),
            RelayError::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
            RelayError::MissingCredential(_) => (StatusCode::INTERNAL_SERVER_ERROR, "relay_misconfigured"),
        };
        error_response(status, kind, &self.to_string())
    }
}
