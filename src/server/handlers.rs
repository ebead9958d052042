//! Handlers for the hub endpoint and the subscriber-facing REST API.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::external::ExternalError;
use crate::feed::discovery::{parse_link_header, rel_contains};
use crate::hub::{HubError, SubscriptionRequest};
use crate::queue::VerifyMode;

// ============================================================================
// Response shapes
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_verification: Option<bool>,
}

impl ApiResponse {
    fn ok() -> Self {
        Self {
            success: true,
            message: None,
            subscription_id: None,
            subscribers: None,
            pending_verification: None,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            subscription_id: None,
            subscribers: None,
            pending_verification: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub queue_depth: i64,
    pub dead_letters: i64,
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::failure(message))).into_response()
}

fn hub_error_response(err: HubError) -> Response {
    if err.is_client_error() {
        bad_request(err.to_string())
    } else {
        (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::failure(err.to_string())),
        )
            .into_response()
    }
}

// ============================================================================
// Health
// ============================================================================

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_depth = state.queue.depth().await.unwrap_or(-1);
    let dead_letters = state.queue.dead_count().await.unwrap_or(-1);
    Json(HealthResponse {
        status: "healthy",
        service: "superduperfeeder",
        version: env!("CARGO_PKG_VERSION"),
        queue_depth,
        dead_letters,
    })
}

// ============================================================================
// Hub endpoint
// ============================================================================

/// `POST /` — the WebSub hub endpoint.
///
/// Accepts the union of subscribe/unsubscribe/publish form requests and
/// raw content notifications (a body with a `Link: <topic>; rel="self"`
/// header, or a `topic` form field).
pub async fn hub_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let params: HashMap<String, String> = if content_type.contains("application/x-www-form-urlencoded")
    {
        url::form_urlencoded::parse(&body).into_owned().collect()
    } else {
        HashMap::new()
    };

    match params.get("hub.mode").map(String::as_str) {
        Some("subscribe") => subscription_request(&state, &params, VerifyMode::Subscribe).await,
        Some("unsubscribe") => subscription_request(&state, &params, VerifyMode::Unsubscribe).await,
        Some("publish") => {
            let topic = match params.get("hub.topic") {
                Some(topic) => topic,
                None => return bad_request("hub.topic is required for publish"),
            };
            match state.hub.process_publish_request(topic).await {
                Ok(subscribers) => (
                    StatusCode::ACCEPTED,
                    Json(ApiResponse {
                        subscribers: Some(subscribers),
                        ..ApiResponse::ok()
                    }),
                )
                    .into_response(),
                Err(err) => hub_error_response(err),
            }
        }
        Some(other) => bad_request(format!("unsupported hub.mode: {other}")),
        None => content_notification(&state, &headers, &params, &body, &content_type).await,
    }
}

async fn subscription_request(
    state: &AppState,
    params: &HashMap<String, String>,
    mode: VerifyMode,
) -> Response {
    let topic = match params.get("hub.topic") {
        Some(topic) => topic.clone(),
        None => return bad_request("hub.topic is required"),
    };
    let callback = match params.get("hub.callback") {
        Some(callback) => callback.clone(),
        None => return bad_request("hub.callback is required"),
    };
    let lease_seconds = match params.get("hub.lease_seconds") {
        Some(raw) => match raw.parse::<u32>() {
            Ok(lease) => Some(lease),
            Err(_) => return bad_request(format!("invalid hub.lease_seconds: {raw}")),
        },
        None => None,
    };

    let request = SubscriptionRequest {
        mode,
        topic,
        callback,
        lease_seconds,
        secret: params.get("hub.secret").cloned(),
    };

    match state.hub.process_subscription_request(request).await {
        // Always 202: verification happens out-of-band, after this
        // response is already on the wire.
        Ok(accepted) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse {
                subscription_id: Some(accepted.subscription_id),
                ..ApiResponse::ok()
            }),
        )
            .into_response(),
        Err(err) => hub_error_response(err),
    }
}

async fn content_notification(
    state: &AppState,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
    body: &Bytes,
    content_type: &str,
) -> Response {
    // Topic comes from the Link header when present, else from the
    // form field literally named "topic".
    let mut topic = None;
    for value in headers.get_all(header::LINK) {
        if let Ok(raw) = value.to_str() {
            for (href, rel) in parse_link_header(raw) {
                if rel_contains(&rel, "self") {
                    topic = Some(href);
                    break;
                }
            }
        }
        if topic.is_some() {
            break;
        }
    }
    let topic = match topic.or_else(|| params.get("topic").cloned()) {
        Some(topic) => topic,
        None => {
            return bad_request("content notification requires a Link rel=\"self\" header or a topic field")
        }
    };

    let content_type = if content_type.is_empty() {
        "application/rss+xml"
    } else {
        content_type
    };

    match state
        .hub
        .process_content_notification(&topic, body, content_type)
        .await
    {
        Ok(subscribers) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse {
                subscribers: Some(subscribers),
                ..ApiResponse::ok()
            }),
        )
            .into_response(),
        Err(err) => hub_error_response(err),
    }
}

// ============================================================================
// REST convenience API
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HubForm {
    #[serde(rename = "hub.topic")]
    topic: String,
    #[serde(rename = "hub.callback")]
    callback: String,
    #[serde(rename = "hub.lease_seconds")]
    lease_seconds: Option<u32>,
    #[serde(rename = "hub.secret")]
    secret: Option<String>,
}

pub async fn api_subscribe(State(state): State<AppState>, Form(form): Form<HubForm>) -> Response {
    api_subscription(state, form, VerifyMode::Subscribe).await
}

pub async fn api_unsubscribe(State(state): State<AppState>, Form(form): Form<HubForm>) -> Response {
    api_subscription(state, form, VerifyMode::Unsubscribe).await
}

async fn api_subscription(state: AppState, form: HubForm, mode: VerifyMode) -> Response {
    let request = SubscriptionRequest {
        mode,
        topic: form.topic,
        callback: form.callback,
        lease_seconds: form.lease_seconds,
        secret: form.secret,
    };
    match state.hub.process_subscription_request(request).await {
        Ok(accepted) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse {
                subscription_id: Some(accepted.subscription_id),
                ..ApiResponse::ok()
            }),
        )
            .into_response(),
        Err(err) => hub_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct WebhookForm {
    topic: String,
    callback: Option<String>,
}

/// `POST /api/webhook` — the high-level flow: discover the hub,
/// subscribe there (or fall back to polling), relay to the callback.
pub async fn api_webhook(State(state): State<AppState>, Form(form): Form<WebhookForm>) -> Response {
    match state
        .external
        .subscribe_to_feed(&form.topic, form.callback.as_deref())
        .await
    {
        Ok(outcome) => {
            let response = ApiResponse {
                success: true,
                message: Some(outcome.message),
                subscription_id: Some(outcome.external_subscription_id),
                subscribers: None,
                pending_verification: outcome.pending_verification.then_some(true),
            };
            (StatusCode::ACCEPTED, Json(response)).into_response()
        }
        Err(err) if err.is_client_error() => bad_request(err.to_string()),
        Err(err) => (StatusCode::OK, Json(ApiResponse::failure(err.to_string()))).into_response(),
    }
}

pub async fn verify_webhook(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    match state.external.confirm_user_callback(&token).await {
        Ok(true) => Json(ApiResponse {
            message: Some("Callback verified".to_string()),
            ..ApiResponse::ok()
        })
        .into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::failure("Unknown or expired verification token")),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::failure(err.to_string())),
        )
            .into_response(),
    }
}

// ============================================================================
// Upstream callback endpoint
// ============================================================================

/// `GET /callback/:id` — upstream hub verification round-trip. The
/// challenge is echoed as text/plain.
pub async fn callback_verification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = match params.get("hub.mode").map(String::as_str) {
        Some("subscribe") => VerifyMode::Subscribe,
        Some("unsubscribe") => VerifyMode::Unsubscribe,
        Some(other) => return bad_request(format!("unsupported hub.mode: {other}")),
        None => return bad_request("hub.mode is required"),
    };
    let topic = match params.get("hub.topic") {
        Some(topic) => topic.clone(),
        None => return bad_request("hub.topic is required"),
    };
    let challenge = match params.get("hub.challenge") {
        Some(challenge) => challenge.clone(),
        None => return bad_request("hub.challenge is required"),
    };
    let lease_seconds = params
        .get("hub.lease_seconds")
        .and_then(|raw| raw.parse::<u32>().ok());

    match state
        .external
        .handle_callback_verification(id, mode, &topic, challenge, lease_seconds)
        .await
    {
        Ok(challenge) => (StatusCode::OK, challenge).into_response(),
        Err(err) => external_error_response(err),
    }
}

/// `POST /callback/:id` — content pushed by the upstream hub.
pub async fn callback_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/rss+xml");

    match state
        .external
        .handle_callback_content(id, content_type, &body)
        .await
    {
        Ok(relays) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse {
                subscribers: Some(relays),
                ..ApiResponse::ok()
            }),
        )
            .into_response(),
        Err(err) => external_error_response(err),
    }
}

fn external_error_response(err: ExternalError) -> Response {
    let status = match &err {
        ExternalError::UnknownCallback => StatusCode::NOT_FOUND,
        ExternalError::NotVerified => StatusCode::FORBIDDEN,
        ExternalError::TopicMismatch => StatusCode::NOT_FOUND,
        err if err.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::failure(err.to_string()))).into_response()
}
