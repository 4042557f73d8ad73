//! Result bridge request handlers.

use crate::run::{EventType, TestEvent};
use crate::server::BridgeState;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Liveness endpoint.
pub async fn handle_live() -> impl IntoResponse {
    "plugdev result bridge"
}

/// Test event endpoint.
///
/// The content type is not checked. A body that is not a test event gets a
/// 400 with a JSON error.
pub async fn handle_update(State(state): State<Arc<BridgeState>>, body: Bytes) -> Response {
    let event: TestEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!("Rejected malformed test event: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("malformed test event: {}", e)})),
            )
                .into_response();
        }
    };

    match event.kind {
        EventType::Start => info!("Test run started"),
        EventType::Debug => debug!("Test debug: {}", event.data.clone().unwrap_or_default()),
        _ => {}
    }
    if let Some(line) = report_line(&event) {
        println!("{}", line);
    }

    let run = state.record(&event).await;
    if event.kind == EventType::End {
        println!("{}", run.summary());
    }

    Json(json!({
        "passed": run.passed,
        "failed": run.failed,
        "pending": run.pending,
        "finished": run.finished,
    }))
    .into_response()
}

pub async fn handle_not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

/// Report line printed for an event, if any.
pub fn report_line(event: &TestEvent) -> Option<String> {
    let title = event.title().unwrap_or("(untitled)");
    match event.kind {
        EventType::Suite => event.title().map(str::to_string),
        EventType::Pass => Some(format!("  \u{2713} {}", title)),
        EventType::Pending => Some(format!("  - {}", title)),
        EventType::Fail => Some(match event.error_message() {
            Some(message) => format!("  \u{2717} {}: {}", title, message),
            None => format!("  \u{2717} {}", title),
        }),
        EventType::Start | EventType::SuiteEnd | EventType::End | EventType::Debug => None,
    }
}
