//! HTTP admin surface: read-only pages plus the JSON/SSE API under `/api`.

mod api;
mod chat;
mod identity;
mod pages;

use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use switchboard_agent::SessionStore;
use switchboard_core::{Error, OutboundMessage, Result, Workspace};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::identities::IdentityStore;
use crate::log_ring::LogRing;
use crate::supervisor::Supervisor;
use crate::SharedConfig;

/// Channel id the web chat uses on the bus.
pub const WEBUI_CHANNEL: &str = "webui";

/// Everything the admin handlers touch, passed explicitly into the router.
#[derive(Clone)]
pub struct AdminState {
    pub(crate) config: SharedConfig,
    pub(crate) config_path: Arc<PathBuf>,
    pub(crate) workspace: Workspace,
    pub(crate) log_ring: LogRing,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) supervisor: Arc<Supervisor>,
    pub(crate) identities: Arc<IdentityStore>,
    pub(crate) chat_events: broadcast::Sender<OutboundMessage>,
    pub(crate) api_token: Option<Arc<str>>,
    pub(crate) started_at: Instant,
}

impl AdminState {
    pub fn new(
        supervisor: Arc<Supervisor>,
        config: SharedConfig,
        config_path: PathBuf,
        workspace: Workspace,
        log_ring: LogRing,
    ) -> Self {
        let api_token = {
            let guard = config.read().unwrap_or_else(|e| e.into_inner());
            guard
                .gateway
                .api_token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(Arc::from)
        };
        let (chat_events, _) = broadcast::channel(64);
        Self {
            sessions: Arc::clone(supervisor.agent().sessions()),
            identities: Arc::new(IdentityStore::new(workspace.clone())),
            config,
            config_path: Arc::new(config_path),
            workspace,
            log_ring,
            supervisor,
            chat_events,
            api_token,
            started_at: Instant::now(),
        }
    }

    /// Forwards replies addressed to the web chat channel to SSE
    /// subscribers until `cancel` trips or the bus closes.
    pub fn spawn_chat_relay(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut rx = self.supervisor.bus().subscribe_outbound(WEBUI_CHANNEL)?;
        let events = self.chat_events.clone();
        Ok(tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    biased;
                    m = rx.recv() => match m {
                        Some(m) => m,
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                };
                // No subscribers is fine; the reply was already returned.
                let _ = events.send(msg);
            }
            debug!("Web chat relay stopped");
        }))
    }
}

/// Error body shared by every API handler: `{status: "error", error}`.
pub(crate) struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Closed(_) | Error::Cancelled(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "status": "error", "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub(crate) type ApiResult<T> = std::result::Result<T, ApiError>;

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer check for `/api/*`. `EventSource` cannot set headers, so a
/// `?token=` query parameter is accepted too.
async fn auth_middleware(State(state): State<AdminState>, req: Request, next: Next) -> Response {
    let token = match &state.api_token {
        Some(t) => Arc::clone(t),
        None => return next.run(req).await,
    };
    if req.uri().path() == "/api/health" {
        return next.run(req).await;
    }

    let from_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .is_some_and(|t| secure_eq(t, &token));
    let authorized = from_header
        || Query::<TokenQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.token)
            .is_some_and(|t| secure_eq(&t, &token));

    if authorized {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, "Unauthorized: invalid or missing Bearer token").into_response()
    }
}

pub fn router(state: AdminState) -> Router {
    let api = Router::new()
        .route("/api/health", get(api::health))
        .route("/api/config", get(api::get_config))
        .route("/api/config/save", post(api::save_config))
        .route("/api/channels/status", get(api::channel_status))
        .route("/api/channels/toggle", post(api::toggle_channel))
        .route("/api/channels/whitelist", post(api::manage_whitelist))
        .route("/api/skills/list", get(api::list_skills))
        .route("/api/skills/install", post(api::install_skill))
        .route("/api/skills/remove", post(api::remove_skill))
        .route("/api/logs/stream", get(api::stream_logs))
        .route("/api/restart", post(api::restart))
        .route("/api/whatsapp/qr", get(api::whatsapp_qr))
        .route("/api/chat/conversations", get(chat::conversations))
        .route("/api/chat/messages", get(chat::messages))
        .route("/api/chat/send", post(chat::send))
        .route("/api/chat/stream", get(chat::stream))
        .route("/api/identities/list", get(identity::list))
        .route("/api/identities/save", post(identity::save))
        .route("/api/identities/activate", post(identity::activate))
        .route("/api/identities/delete", post(identity::delete))
        .route("/api/identities/template", get(identity::template))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let pages = Router::new()
        .route("/", get(pages::dashboard))
        .route("/channels", get(pages::channels))
        .route("/skills", get(pages::skills))
        .route("/logs", get(pages::logs))
        .route("/settings", get(pages::settings))
        .route("/chat", get(pages::chat))
        .route("/identities", get(pages::identities));

    api.merge(pages)
        .layer(CorsLayer::permissive().allow_credentials(false))
        .with_state(state)
}

/// Serves the admin API on `listener` until `shutdown` trips. SSE streams
/// end when the supervisor shuts down, so cancel that first.
pub async fn serve(state: AdminState, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    let relay = state.spawn_chat_relay(shutdown.clone())?;
    info!(addr = %addr, "Admin API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    relay.abort();
    info!("Admin API stopped");
    Ok(())
}
