//! Webhook receiver powered by axum.
//!
//! Serves:
//! - `POST /webhook/{secret}`: Telegram update delivery
//! - `GET  /health`: liveness probe
//! - `GET  /`: embedded Web App page

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::PathRejection, Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{any, get},
    Router,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::event::{EnvelopeError, InboundEvent};
use crate::queue::{DispatchQueue, Pushed, QueueError};
use crate::secret::Secret;

const WEB_APP_HTML: &str = include_str!("../static/webapp.html");

/// Largest body read from a delivery whose path and header secret matched.
/// Telegram updates are far smaller.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Header Telegram echoes back when `secret_token` was set on the webhook.
pub const SECRET_TOKEN_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct ReceiverState {
    pub queue: Arc<DispatchQueue>,
    pub path_secret: Secret,
    pub header_secret: Option<Secret>,
    pub serve_page: bool,
}

/// Every way a delivery can be refused. Responses carry no body, so nothing
/// about the configuration leaks to the caller.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("not found")]
    NotFound,
    #[error("unreadable body: {0}")]
    Unreadable(axum::Error),
    #[error(transparent)]
    Malformed(#[from] EnvelopeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unreadable(_) | Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        status.into_response()
    }
}

pub fn build_router(state: ReceiverState) -> Router {
    Router::new()
        .route("/webhook/{secret}", any(receive_update))
        .route("/health", get(health_check))
        .route("/", any(web_app_page))
        .with_state(state)
}

/// POST /webhook/{secret}: parse, enqueue, acknowledge.
///
/// Handlers never run here; the 200 only means the update was queued. The
/// body is only read once the path and header secrets matched, so a caller
/// without them sees a 404 whatever it sends.
async fn receive_update(
    State(state): State<ReceiverState>,
    method: Method,
    segment: Result<Path<String>, PathRejection>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, WebhookError> {
    let Ok(Path(segment)) = segment else {
        return Err(WebhookError::NotFound);
    };
    if !state.path_secret.matches(&segment) || method != Method::POST {
        return Err(WebhookError::NotFound);
    }
    if let Some(expected) = &state.header_secret {
        let presented = headers
            .get(SECRET_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !expected.matches(presented) {
            return Err(WebhookError::NotFound);
        }
    }

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| {
            warn!("Could not read webhook body: {}", e);
            WebhookError::Unreadable(e)
        })?;
    let event = InboundEvent::parse(&body).map_err(|e| {
        warn!("Rejected webhook body: {}", e);
        e
    })?;
    let update_id = event.update_id();

    match state.queue.push(event) {
        Ok(Pushed::Queued) => {
            debug!(update_id, queued = state.queue.len(), "Update queued");
        }
        Ok(Pushed::Evicted(old)) => {
            warn!(
                update_id,
                evicted_update_id = old.update_id(),
                "Dispatch queue full, evicted oldest update"
            );
        }
        Err(e) => {
            warn!(update_id, "Update refused: {}", e);
            return Err(e.into());
        }
    }
    Ok(StatusCode::OK)
}

/// Always OK. Touches nothing.
async fn health_check() -> &'static str {
    "OK"
}

/// GET /: the page the `/openweb` button opens inside Telegram.
async fn web_app_page(State(state): State<ReceiverState>, method: Method) -> Response {
    if state.serve_page && (method == Method::GET || method == Method::HEAD) {
        Html(WEB_APP_HTML).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}
