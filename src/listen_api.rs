//! HTTP ingress for platform callbacks.
//!
//! `POST /event` takes one platform callback and answers with the
//! `{challenge?, elements}` response. `GET /health` is always public; the
//! event route can be put behind a shared API key.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::{
    dispatch::Dispatcher,
    error::{BridgeError, ErrorKind},
    types::InboundEvent,
};

#[derive(Clone)]
struct IngressState {
    dispatcher: Dispatcher,
    api_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn ingress_router(dispatcher: Dispatcher, api_key: Option<String>) -> axum::Router {
    use axum::{middleware, routing, Router};

    let state = IngressState {
        dispatcher,
        api_key: api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };

    let protected = Router::new()
        .route("/event", routing::post(ingress_event))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ingress_auth_middleware,
        ));

    Router::new()
        .route("/health", routing::get(ingress_health))
        .merge(protected)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn ingress_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "case-bridge",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn error_envelope(code: &str, message: &str, retryable: bool, status: StatusCode) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message,
            "retryable": retryable,
            "statusCode": status.as_u16(),
        }
    })
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Routing | ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Integration => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &BridgeError) -> Response {
    let kind = error.kind();
    let status = status_for(kind);
    let body = error_envelope(
        kind.as_str(),
        &error.to_string(),
        kind == ErrorKind::Integration,
        status,
    );
    (status, Json(body)).into_response()
}

async fn ingress_auth_middleware(
    State(state): State<IngressState>,
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|value| !value.is_empty())
        });

    if provided != Some(expected) {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(error_envelope(
                "unauthorized",
                "Missing or invalid API key",
                false,
                StatusCode::UNAUTHORIZED,
            )),
        ));
    }

    Ok(next.run(request).await)
}

async fn ingress_event(State(state): State<IngressState>, body: Bytes) -> Response {
    let event: InboundEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(error) => {
            tracing::warn!(target = "case_bridge::ingress", error = %error, "rejecting malformed event");
            return (
                StatusCode::BAD_REQUEST,
                Json(error_envelope(
                    "invalid_event",
                    &format!("malformed event payload: {error}"),
                    false,
                    StatusCode::BAD_REQUEST,
                )),
            )
                .into_response();
        }
    };

    match state.dispatcher.serve_guarded(event).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => {
            tracing::warn!(
                target = "case_bridge::ingress",
                kind = error.kind().as_str(),
                error = %error,
                "event failed"
            );
            error_response(&error)
        }
    }
}
