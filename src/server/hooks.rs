//! Trigger endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::core::dispatcher::DispatchError;
use crate::trigger::{RawEvent, RejectedEvent};

pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const EVENT_HEADER: &str = "x-github-event";

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// POST /hooks/push
/// Validate a push notification and queue a run for it
pub async fn receive_push(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let raw = RawEvent {
        signature: header(&headers, SIGNATURE_HEADER),
        delivery_id: header(&headers, DELIVERY_HEADER),
        event: header(&headers, EVENT_HEADER),
        body: body.to_vec(),
    };

    let request = match state.receiver.receive(&raw) {
        Ok(request) => request,
        Err(RejectedEvent::Unauthorized) => {
            tracing::warn!("Rejected push with bad signature");
            return Err(ApiError::Unauthorized);
        }
        Err(RejectedEvent::Invalid(msg)) => return Err(ApiError::Unprocessable(msg)),
        Err(RejectedEvent::Unsupported { reason }) => {
            tracing::debug!("Ignoring event: {}", reason);
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
        Err(RejectedEvent::Duplicate { delivery_id }) => {
            tracing::info!("Duplicate delivery {}", delivery_id);
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "status": "duplicate", "delivery_id": delivery_id })),
            )
                .into_response());
        }
    };

    match state.dispatcher.submit(&request).await {
        Ok(run) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "queued",
                "run_id": run.id,
                "delivery_id": request.delivery_id,
            })),
        )
            .into_response()),
        Err(e) => {
            // Let the sender's redelivery through once there is room
            state.receiver.forget(&request.delivery_id);
            match e {
                DispatchError::QueueFull(_) | DispatchError::Closed(_) => {
                    Err(ApiError::Unavailable(e.to_string()))
                }
                DispatchError::Store(e) => Err(e.into()),
            }
        }
    }
}
