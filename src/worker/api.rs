//! Worker-orchestration HTTP API
//!
//! `POST /join` and `POST /leave` drive the orchestrator (calendar poller
//! or manual callers), `GET /status` and `GET /meetings` expose state, and
//! `GET /dashboard` renders a small HTML summary.

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use super::{JoinError, MeetingOrchestrator};

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "meetLink")]
    pub meet_link: String,
    #[serde(default, rename = "botName")]
    pub bot_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LeaveRequest {
    #[serde(rename = "meetingId")]
    pub meeting_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Build the orchestration router.
pub fn router(orchestrator: Arc<MeetingOrchestrator>) -> Router {
    Router::new()
        .route("/join", post(join_handler))
        .route("/leave", post(leave_handler))
        .route("/status", get(status_handler))
        .route("/meetings", get(meetings_handler))
        .route("/dashboard", get(dashboard_handler))
        .with_state(orchestrator)
}

async fn join_handler(
    State(orchestrator): State<Arc<MeetingOrchestrator>>,
    Json(request): Json<JoinRequest>,
) -> impl IntoResponse {
    match orchestrator.join_meeting(&request.meet_link, request.bot_name.as_deref()).await {
        Ok(meeting_id) => {
            (StatusCode::ACCEPTED, Json(json!({ "meetingId": meeting_id }))).into_response()
        }
        Err(e) => {
            warn!("Join failed: {:#}", e);
            let status = match &e {
                JoinError::CapReached(_) => StatusCode::TOO_MANY_REQUESTS,
                JoinError::BadLink(_) => StatusCode::BAD_REQUEST,
                JoinError::Launch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

async fn leave_handler(
    State(orchestrator): State<Arc<MeetingOrchestrator>>,
    Json(request): Json<LeaveRequest>,
) -> impl IntoResponse {
    match orchestrator.leave_meeting(&request.meeting_id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "ok": true }))).into_response(),
        Err(e) => {
            (StatusCode::NOT_FOUND, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

async fn status_handler(State(orchestrator): State<Arc<MeetingOrchestrator>>) -> impl IntoResponse {
    Json(json!({
        "active": orchestrator.active_count().await,
        "capacity": orchestrator.capacity(),
    }))
}

async fn meetings_handler(
    State(orchestrator): State<Arc<MeetingOrchestrator>>,
) -> impl IntoResponse {
    Json(orchestrator.list_meetings().await)
}

/// Minimal HTML summary of tracked meetings
async fn dashboard_handler(
    State(orchestrator): State<Arc<MeetingOrchestrator>>,
) -> Html<String> {
    let meetings = orchestrator.list_meetings().await;

    let mut rows = String::new();
    for m in &meetings {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{:?}</td><td>{}</td><td>{}</td></tr>",
            m.meeting_id,
            html_escape(&m.external_url),
            m.status,
            m.transcript_count,
            m.started_at.format("%Y-%m-%d %H:%M:%S"),
        ));
    }
    if meetings.is_empty() {
        rows.push_str("<tr><td colspan=\"5\">No active meetings</td></tr>");
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Voxbridge Meetings</title>
    <meta charset="utf-8">
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 900px;
            margin: 0 auto;
            padding: 20px;
            background: #1a1a1a;
            color: #e0e0e0;
        }}
        h1 {{ color: #4CAF50; }}
        table {{ width: 100%; border-collapse: collapse; }}
        th, td {{ padding: 8px 12px; border-bottom: 1px solid #333; text-align: left; }}
        th {{ background: #2a2a2a; }}
    </style>
</head>
<body>
    <h1>Meeting Workers</h1>
    <p>{} of {} slots in use</p>
    <table>
        <tr><th>ID</th><th>Link</th><th>Status</th><th>Transcripts</th><th>Started</th></tr>
        {}
    </table>
</body>
</html>"#,
        orchestrator.active_count().await,
        orchestrator.capacity(),
        rows,
    ))
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_request_parses() {
        let request: JoinRequest =
            serde_json::from_str(r#"{"meetLink":"https://meet.example/x","botName":"Nova"}"#)
                .unwrap();
        assert_eq!(request.meet_link, "https://meet.example/x");
        assert_eq!(request.bot_name.as_deref(), Some("Nova"));

        let request: JoinRequest =
            serde_json::from_str(r#"{"meetLink":"https://meet.example/y"}"#).unwrap();
        assert!(request.bot_name.is_none());
    }

    #[test]
    fn escape_neutralizes_markup() {
        assert_eq!(html_escape("<b>&x</b>"), "&lt;b&gt;&amp;x&lt;/b&gt;");
    }
}
