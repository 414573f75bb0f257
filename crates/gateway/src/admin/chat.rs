//! Web chat backed by the live session store. A conversation is the
//! session `webui:<conversation_id>`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use switchboard_agent::TurnStatus;
use switchboard_core::{Error, OutboundMessage};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};

use super::api::payload;
use super::{AdminState, ApiResult, WEBUI_CHANNEL};

const KEEP_ALIVE: Duration = Duration::from_secs(30);

fn session_key(conversation_id: &str) -> String {
    format!("{}:{}", WEBUI_CHANNEL, conversation_id)
}

fn valid_conversation_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub(crate) async fn conversations(State(state): State<AdminState>) -> Json<Value> {
    let prefix = session_key("");
    let conversations: Vec<Value> = state
        .sessions
        .list(&prefix)
        .into_iter()
        .map(|s| {
            json!({
                "id": s.key.trim_start_matches(&prefix),
                "messages": s.messages,
                "preview": s.preview,
                "created_at": s.created_at,
                "updated_at": s.updated_at,
            })
        })
        .collect();
    Json(json!({ "status": "ok", "conversations": conversations }))
}

#[derive(Deserialize)]
pub(crate) struct MessagesQuery {
    conversation_id: String,
}

/// User and assistant turns of one conversation; tool traffic is omitted.
pub(crate) async fn messages(
    State(state): State<AdminState>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let handle = state
        .sessions
        .get(&session_key(&query.conversation_id))
        .ok_or_else(|| Error::NotFound(format!("conversation '{}'", query.conversation_id)))?;
    let session = handle.lock().await;
    let messages: Vec<Value> = session
        .history
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .map(|m| (m.role.as_str(), m.text()))
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect();
    Ok(Json(json!({
        "status": "ok",
        "conversation_id": query.conversation_id,
        "messages": messages,
    })))
}

#[derive(Deserialize)]
pub(crate) struct SendRequest {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

/// Runs one agent turn synchronously and returns the reply. The reply is
/// also published on the bus so open chat streams see it.
pub(crate) async fn send(
    State(state): State<AdminState>,
    body: std::result::Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = payload(body)?;
    let text = req.message.trim();
    if text.is_empty() {
        return Err(Error::Validation("message cannot be empty".to_string()).into());
    }
    let conversation_id = match req.conversation_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => {
            if !valid_conversation_id(id) {
                return Err(Error::Validation(format!("invalid conversation id '{}'", id)).into());
            }
            id.to_string()
        }
        _ => uuid::Uuid::new_v4().to_string(),
    };

    let key = session_key(&conversation_id);
    info!(conversation = %conversation_id, len = text.len(), "Web chat message received");
    let cancel = state.supervisor.shutdown_token().child_token();
    let outcome = state
        .supervisor
        .agent()
        .run_turn(&key, WEBUI_CHANNEL, text, &cancel)
        .await?;

    let reply = OutboundMessage::new(WEBUI_CHANNEL, &conversation_id, &outcome.reply);
    if let Err(e) = state.supervisor.bus().publish_outbound(reply).await {
        debug!(error = %e, "Web chat reply not relayed");
    }

    let turn_status = match outcome.status {
        TurnStatus::Completed => "completed",
        TurnStatus::Truncated => "truncated",
        TurnStatus::Failed => "failed",
    };
    Ok(Json(json!({
        "status": "ok",
        "conversation_id": conversation_id,
        "response": outcome.reply,
        "turn_status": turn_status,
        "tool_calls": outcome.tool_calls,
    })))
}

#[derive(Deserialize)]
pub(crate) struct StreamQuery {
    #[serde(default)]
    conversation_id: Option<String>,
}

/// SSE feed of replies on the web chat channel, optionally narrowed to one
/// conversation.
pub(crate) async fn stream(
    State(state): State<AdminState>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let filter = query.conversation_id;
    let stream = BroadcastStream::new(state.chat_events.subscribe())
        .filter_map(move |r| {
            let keep = match (&r, &filter) {
                (Ok(msg), Some(id)) => msg.chat_id == *id,
                (Ok(_), None) => true,
                (Err(_), _) => false,
            };
            async move { if keep { r.ok() } else { None } }
        })
        .map(|msg| {
            Event::default().json_data(json!({
                "type": "message",
                "role": "assistant",
                "conversation_id": msg.chat_id,
                "content": msg.content,
            }))
        })
        .take_until(state.supervisor.shutdown_token().cancelled_owned());
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}

#[cfg(test)]
mod tests {
    use super::super::tests::app;
    use super::super::router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::StreamExt;
    use serde_json::{json, Value};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_send_creates_conversation_with_history() {
        let app = app();
        let (status, body) = app.post("/api/chat/send", json!({"message": "hello there"})).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["response"], "you said: hello there");
        assert_eq!(body["turn_status"], "completed");
        let conv = body["conversation_id"].as_str().unwrap().to_string();

        let (_, body) = app
            .post("/api/chat/send", json!({"message": "again", "conversation_id": conv}))
            .await;
        assert_eq!(body["conversation_id"], conv.as_str());

        let (_, list) = app.get("/api/chat/conversations").await;
        let convs = list["conversations"].as_array().unwrap();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0]["id"], conv.as_str());
        assert_eq!(convs[0]["preview"], "hello there");

        let (status, msgs) = app.get(&format!("/api/chat/messages?conversation_id={}", conv)).await;
        assert_eq!(status, StatusCode::OK);
        let roles: Vec<&str> = msgs["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);
    }

    #[tokio::test]
    async fn test_send_validation_and_unknown_conversation() {
        let app = app();
        let (status, _) = app.post("/api/chat/send", json!({"message": "  "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = app
            .post("/api/chat/send", json!({"message": "hi", "conversation_id": "../x"}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = app.get("/api/chat/messages?conversation_id=nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "error");
        let (_, list) = app.get("/api/chat/conversations").await;
        assert!(list["conversations"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_relays_replies_for_conversation() {
        let app = app();
        let relay = app.state.spawn_chat_relay(CancellationToken::new()).unwrap();

        let req = Request::builder()
            .uri("/api/chat/stream?conversation_id=c1")
            .body(Body::empty())
            .unwrap();
        let resp = router(app.state.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let mut body = resp.into_body().into_data_stream();

        app.post("/api/chat/send", json!({"message": "other", "conversation_id": "c2"}))
            .await;
        app.post("/api/chat/send", json!({"message": "mine", "conversation_id": "c1"}))
            .await;

        let event = loop {
            let chunk = body.next().await.unwrap().unwrap();
            let text = String::from_utf8(chunk.to_vec()).unwrap();
            if let Some(data) = text.strip_prefix("data: ") {
                break serde_json::from_str::<Value>(data.trim()).unwrap();
            }
        };
        assert_eq!(event["conversation_id"], "c1");
        assert_eq!(event["content"], "you said: mine");
        relay.abort();
    }
}
