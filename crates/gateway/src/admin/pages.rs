//! Server-rendered admin pages. They carry no secrets: anything sensitive
//! is fetched by the page script through the token-protected JSON API.

use axum::extract::State;
use axum::response::Html;
use std::fmt::Write;

use super::AdminState;
use crate::identities::template_names;

const CSS: &str = include_str!("../../static/admin.css");
const JS: &str = include_str!("../../static/admin.js");

const NAV: [(&str, &str, &str); 7] = [
    ("dashboard", "/", "Dashboard"),
    ("channels", "/channels", "Channels"),
    ("skills", "/skills", "Skills"),
    ("logs", "/logs", "Logs"),
    ("settings", "/settings", "Settings"),
    ("chat", "/chat", "Chat"),
    ("identities", "/identities", "Identities"),
];

pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn layout(page: &str, title: &str, body: &str) -> Html<String> {
    let mut nav = String::new();
    for (id, href, label) in NAV {
        let class = if id == page { " class=\"active\"" } else { "" };
        let _ = write!(nav, "<a href=\"{}\"{}>{}</a>", href, class, label);
    }
    Html(format!(
        "<!DOCTYPE html>\n<html lang=\"en\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>{title} · switchboard</title><style>{css}</style></head>\
         <body data-page=\"{page}\"><header><h1>switchboard</h1><nav>{nav}</nav></header>\
         <main><h2>{title}</h2><div id=\"flash\"></div>{body}</main>\
         <script>{js}</script></body></html>",
        title = escape(title),
        css = CSS,
        js = JS,
        page = page,
        nav = nav,
        body = body,
    ))
}

fn badge(state: &str) -> String {
    format!("<span class=\"badge {0}\">{0}</span>", escape(state))
}

pub(crate) async fn dashboard(State(state): State<AdminState>) -> Html<String> {
    let channels = state.supervisor.channels().status();
    let running = channels.iter().filter(|c| c.running).count();
    let skills = state.supervisor.agent().skills().list_skills();
    let sessions = state.sessions.list("").len();
    let uptime = state.started_at.elapsed().as_secs();

    let mut body = String::from("<div class=\"cards\">");
    let cards = [
        ("Gateway", badge(state.supervisor.state().as_str())),
        ("Uptime", format!("{}h {}m", uptime / 3600, (uptime % 3600) / 60)),
        ("Channels running", format!("{} / {}", running, channels.len())),
        ("Skills", skills.iter().filter(|s| !s.shadowed).count().to_string()),
        ("Sessions", sessions.to_string()),
    ];
    for (label, value) in cards {
        let _ = write!(
            body,
            "<div class=\"card\"><div class=\"muted\">{}</div><div class=\"value\">{}</div></div>",
            label, value
        );
    }
    body.push_str("</div><h3>Recent log</h3><table>");
    let entries = state.log_ring.snapshot();
    for entry in entries.iter().rev().take(10) {
        let _ = write!(
            body,
            "<tr><td class=\"muted\">{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            entry.timestamp.format("%H:%M:%S"),
            escape(&entry.level),
            escape(&entry.component),
            escape(&entry.message)
        );
    }
    body.push_str("</table>");
    layout("dashboard", "Dashboard", &body)
}

pub(crate) async fn channels(State(state): State<AdminState>) -> Html<String> {
    let statuses = state.supervisor.channels().status();
    let config = state.config.read().unwrap_or_else(|e| e.into_inner()).clone();

    let mut body = String::from(
        "<p class=\"muted\">Enable or disable changes apply after a restart. \
         Allow-list edits apply immediately.</p>\
         <p><button id=\"restart\">Restart gateway</button></p>\
         <table><tr><th>Channel</th><th>Enabled</th><th>State</th><th>Detail</th>\
         <th>Allowed senders</th><th></th></tr>",
    );
    for status in &statuses {
        let allowed = config
            .channels
            .allow_from(&status.name)
            .map(|l| l.iter().map(|s| escape(s)).collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        let _ = write!(
            body,
            "<tr><td>{name}</td><td>{enabled}</td><td>{state}</td><td class=\"muted\">{detail}</td>\
             <td>{allowed}<form data-whitelist=\"{name}\"><input name=\"user_id\" placeholder=\"sender id\">\
             <button value=\"add\">Add</button> <button class=\"secondary\" value=\"remove\">Remove</button></form></td>\
             <td><button data-toggle=\"{name}\" data-enabled=\"{enabled}\">{label}</button></td></tr>",
            name = escape(&status.name),
            enabled = status.enabled,
            state = badge(status.state.as_str()),
            detail = escape(&status.detail),
            allowed = if allowed.is_empty() { "<span class=\"muted\">everyone</span>".to_string() } else { allowed },
            label = if status.enabled { "Disable" } else { "Enable" },
        );
    }
    body.push_str("</table>");
    layout("channels", "Channels", &body)
}

pub(crate) async fn skills(State(state): State<AdminState>) -> Html<String> {
    let skills = state.supervisor.agent().skills().list_skills();
    let mut body = String::from(
        "<form id=\"install\"><input name=\"repository\" placeholder=\"owner/repo\"> \
         <button>Install from GitHub</button></form><br>\
         <table><tr><th>Name</th><th>Source</th><th>Description</th><th>Status</th><th></th></tr>",
    );
    for skill in &skills {
        let status = if skill.shadowed {
            "shadowed".to_string()
        } else if skill.available {
            "available".to_string()
        } else {
            format!("unavailable: {}", skill.unavailable_reason.as_deref().unwrap_or("unknown"))
        };
        let remove = if skill.source_root.as_str() == "workspace" {
            format!("<button class=\"secondary\" data-remove=\"{0}\">Remove</button>", escape(&skill.name))
        } else {
            String::new()
        };
        let _ = write!(
            body,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td class=\"muted\">{}</td><td>{}</td></tr>",
            escape(&skill.name),
            skill.source_root.as_str(),
            escape(&skill.description),
            escape(&status),
            remove
        );
    }
    if skills.is_empty() {
        body.push_str("<tr><td colspan=\"5\" class=\"muted\">No skills installed</td></tr>");
    }
    body.push_str("</table>");
    layout("skills", "Skills", &body)
}

pub(crate) async fn logs(State(state): State<AdminState>) -> Html<String> {
    let body = format!(
        "<p class=\"muted\">Keeping the last {} entries.</p><div id=\"log-view\"></div>",
        state.log_ring.capacity()
    );
    layout("logs", "Logs", &body)
}

pub(crate) async fn settings() -> Html<String> {
    let body = "<h3>API token</h3>\
        <p class=\"muted\">Stored in this browser and sent as a Bearer token.</p>\
        <input id=\"token\" type=\"password\"> <p><button id=\"save-token\">Save token</button></p>\
        <h3>Configuration</h3>\
        <textarea id=\"config\" rows=\"28\"></textarea>\
        <p><button id=\"save-config\">Save configuration</button> \
        <button class=\"secondary\" id=\"load-config\" onclick=\"api('/api/config')\
        .then(c => document.getElementById('config').value = JSON.stringify(c, null, 2))\
        .catch(e => flash(e.message, true))\">Load</button></p>";
    layout("settings", "Settings", body)
}

pub(crate) async fn chat() -> Html<String> {
    let body = "<div id=\"chat-log\"></div><br>\
        <form id=\"chat-form\"><input name=\"message\" placeholder=\"Say something\" autocomplete=\"off\"> \
        <p><button>Send</button></p></form>";
    layout("chat", "Chat", body)
}

pub(crate) async fn identities(State(state): State<AdminState>) -> Html<String> {
    let mut body = String::from(
        "<table><tr><th></th><th>Name</th><th>Category</th><th>Description</th><th></th></tr>",
    );
    match state.identities.list() {
        Ok(list) => {
            for identity in list {
                let actions = if identity.is_active {
                    "<span class=\"badge running\">active</span>".to_string()
                } else {
                    let mut a = format!(
                        "<button data-activate=\"{0}\">Activate</button>",
                        escape(&identity.id)
                    );
                    if !identity.is_default {
                        let _ = write!(
                            a,
                            " <button class=\"secondary\" data-delete=\"{0}\">Delete</button>",
                            escape(&identity.id)
                        );
                    }
                    a
                };
                let _ = write!(
                    body,
                    "<tr><td>{}</td><td>{}</td><td>{}</td><td class=\"muted\">{}</td><td>{}</td></tr>",
                    escape(&identity.icon),
                    escape(&identity.name),
                    escape(&identity.category),
                    escape(&identity.description),
                    actions
                );
            }
        }
        Err(e) => {
            let _ = write!(body, "<tr><td colspan=\"5\">{}</td></tr>", escape(&e.to_string()));
        }
    }
    body.push_str("</table><h3>Templates</h3><p>");
    for name in template_names() {
        let _ = write!(body, "<button data-template=\"{0}\">Create from {0}</button> ", name);
    }
    body.push_str("</p>");
    layout("identities", "Identities", &body)
}
