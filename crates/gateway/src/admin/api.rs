use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use switchboard_core::config::ChannelsConfig;
use switchboard_core::{Config, Error};
use switchboard_skills::{install_from_github, uninstall, SkillDescriptor};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use super::{AdminState, ApiResult};

pub(crate) fn payload<T>(body: std::result::Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(v)| v)
        .map_err(|e| Error::Validation(format!("invalid request: {}", e.body_text())).into())
}

fn ok() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Applies `edit` to the live config and persists it; the in-memory copy is
/// only replaced once the file is written.
fn update_config<R>(state: &AdminState, edit: impl FnOnce(&mut Config) -> ApiResult<R>) -> ApiResult<R> {
    let mut guard = state.config.write().unwrap_or_else(|e| e.into_inner());
    let mut next = guard.clone();
    let out = edit(&mut next)?;
    next.save(&state.config_path)
        .map_err(|e| Error::Config(format!("failed to save config: {}", e)))?;
    *guard = next;
    Ok(out)
}

pub(crate) async fn health(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "state": state.supervisor.state(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

pub(crate) async fn get_config(State(state): State<AdminState>) -> Json<Config> {
    let guard = state.config.read().unwrap_or_else(|e| e.into_inner());
    Json(guard.clone())
}

pub(crate) async fn save_config(
    State(state): State<AdminState>,
    body: std::result::Result<Json<Config>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let new_config = payload(body)?;
    new_config
        .validate()
        .map_err(|e| Error::Validation(e.to_string()))?;
    let allow_lists: Vec<(&str, Vec<String>)> = ChannelsConfig::NAMES
        .iter()
        .map(|&name| {
            let ids = new_config
                .channels
                .allow_from(name)
                .map(|list| list.iter().cloned().collect())
                .unwrap_or_default();
            (name, ids)
        })
        .collect();
    update_config(&state, |cfg| {
        *cfg = new_config;
        Ok(())
    })?;

    // Allow-lists apply live; everything else waits for a restart.
    let channels = state.supervisor.channels();
    for (name, ids) in allow_lists {
        if let Some(live) = channels.allow_list(name) {
            live.replace(ids);
        }
    }
    info!(path = %state.config_path.display(), "Configuration saved from admin API");
    Ok(ok())
}

pub(crate) async fn channel_status(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "supervisor": state.supervisor.state(),
        "channels": state.supervisor.channels().status(),
    }))
}

#[derive(Deserialize)]
pub(crate) struct ToggleRequest {
    channel: String,
    enabled: bool,
}

pub(crate) async fn toggle_channel(
    State(state): State<AdminState>,
    body: std::result::Result<Json<ToggleRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = payload(body)?;
    update_config(&state, |cfg| {
        if cfg.channels.set_enabled(&req.channel, req.enabled) {
            Ok(())
        } else {
            Err(Error::Validation(format!("unknown channel '{}'", req.channel)).into())
        }
    })?;
    info!(channel = %req.channel, enabled = req.enabled, "Channel toggled; takes effect on restart");
    Ok(ok())
}

#[derive(Deserialize)]
pub(crate) struct WhitelistRequest {
    channel: String,
    action: String,
    user_id: String,
}

/// Edits the persisted allow-list and the live one the adapter reads.
pub(crate) async fn manage_whitelist(
    State(state): State<AdminState>,
    body: std::result::Result<Json<WhitelistRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = payload(body)?;
    let user_id = req.user_id.trim().to_string();
    if user_id.is_empty() {
        return Err(Error::Validation("user_id is required".to_string()).into());
    }
    if !ChannelsConfig::NAMES.contains(&req.channel.as_str()) {
        return Err(Error::Validation(format!("unknown channel '{}'", req.channel)).into());
    }
    let adding = match req.action.as_str() {
        "add" => true,
        "remove" => false,
        other => return Err(Error::Validation(format!("unknown action '{}'", other)).into()),
    };

    let allow_from = update_config(&state, |cfg| {
        let list = cfg
            .channels
            .allow_from_mut(&req.channel)
            .ok_or_else(|| Error::Validation(format!("unknown channel '{}'", req.channel)))?;
        if adding {
            if !list.contains(&user_id) {
                list.push(user_id.clone());
            }
        } else {
            list.remove(&user_id);
        }
        Ok(list.iter().cloned().collect::<Vec<_>>())
    })?;

    if let Some(live) = state.supervisor.channels().allow_list(&req.channel) {
        if adding {
            live.add(&user_id);
        } else {
            live.remove(&user_id);
        }
    }
    info!(channel = %req.channel, action = %req.action, user = %user_id, "Allow-list updated");
    Ok(Json(json!({ "status": "ok", "allow_from": allow_from })))
}

pub(crate) async fn list_skills(State(state): State<AdminState>) -> Json<Value> {
    let mut grouped: BTreeMap<&'static str, Vec<SkillDescriptor>> = BTreeMap::new();
    for root in ["workspace", "global", "builtin"] {
        grouped.insert(root, Vec::new());
    }
    for skill in state.supervisor.agent().skills().list_skills() {
        grouped.entry(skill.source_root.as_str()).or_default().push(skill);
    }
    Json(json!({ "status": "ok", "skills": grouped }))
}

#[derive(Deserialize)]
pub(crate) struct InstallRequest {
    repository: String,
}

pub(crate) async fn install_skill(
    State(state): State<AdminState>,
    body: std::result::Result<Json<InstallRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = payload(body)?;
    if req.repository.trim().is_empty() {
        return Err(Error::Validation("repository is required".to_string()).into());
    }
    let name = install_from_github(req.repository.trim(), &state.workspace.skills_dir()).await?;
    state.supervisor.agent().skills().reload();
    Ok(Json(json!({ "status": "ok", "name": name })))
}

#[derive(Deserialize)]
pub(crate) struct RemoveRequest {
    name: String,
}

pub(crate) async fn remove_skill(
    State(state): State<AdminState>,
    body: std::result::Result<Json<RemoveRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = payload(body)?;
    uninstall(&req.name, &state.workspace.skills_dir())?;
    state.supervisor.agent().skills().reload();
    Ok(ok())
}

/// Buffered entries first, then live ones. A lagging client skips what it
/// missed rather than stalling the ring.
pub(crate) async fn stream_logs(
    State(state): State<AdminState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let (backlog, rx) = state.log_ring.subscribe();
    let live = BroadcastStream::new(rx).filter_map(|r| async move { r.ok() });
    let stream = futures::stream::iter(backlog)
        .chain(live)
        .map(|entry| Event::default().json_data(&entry))
        .take_until(state.supervisor.shutdown_token().cancelled_owned());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub(crate) async fn restart(State(state): State<AdminState>) -> Json<Value> {
    state.supervisor.request_restart();
    Json(json!({
        "status": "ok",
        "message": "Restart scheduled: in-flight turns drain, then channels restart from the saved configuration",
    }))
}

pub(crate) async fn whatsapp_qr(State(state): State<AdminState>) -> Json<Value> {
    let channel_state = state
        .supervisor
        .channels()
        .get("whatsapp")
        .map(|ch| ch.state().as_str());

    let qr = match tokio::fs::read_to_string(state.workspace.whatsapp_qr_ascii()).await {
        Ok(qr) => qr,
        Err(_) => {
            return Json(json!({
                "status": "pending",
                "message": "No QR code yet. Make sure the WhatsApp channel is enabled and the gateway is running.",
                "qr_code": "",
                "channel_state": channel_state,
            }));
        }
    };
    let raw = match tokio::fs::read_to_string(state.workspace.whatsapp_qr_code()).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "QR art present without raw code");
            String::new()
        }
    };
    Json(json!({
        "status": "waiting",
        "message": "QR code ready, scan it with WhatsApp",
        "qr_code": qr,
        "raw_code": raw,
        "channel_state": channel_state,
    }))
}
