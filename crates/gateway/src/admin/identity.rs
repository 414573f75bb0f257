use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use switchboard_core::Error;

use super::api::payload;
use super::{AdminState, ApiResult};
use crate::identities::{self, Identity};

pub(crate) async fn list(State(state): State<AdminState>) -> ApiResult<Json<Value>> {
    let identities = state.identities.list()?;
    let templates: Vec<Value> = identities::template_names()
        .into_iter()
        .filter_map(identities::template)
        .map(|t| {
            json!({
                "id": t.id,
                "name": t.name,
                "description": t.description,
                "icon": t.icon,
                "category": t.category,
            })
        })
        .collect();
    Ok(Json(json!({
        "status": "ok",
        "identities": identities,
        "templates": templates,
    })))
}

pub(crate) async fn save(
    State(state): State<AdminState>,
    body: std::result::Result<Json<Identity>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let identity = state.identities.save(payload(body)?)?;
    Ok(Json(json!({ "status": "ok", "identity": identity })))
}

#[derive(Deserialize)]
pub(crate) struct IdRequest {
    id: String,
}

/// Persona files change immediately; the next turn picks them up.
pub(crate) async fn activate(
    State(state): State<AdminState>,
    body: std::result::Result<Json<IdRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = payload(body)?;
    let identity = state.identities.activate(req.id.trim())?;
    Ok(Json(json!({ "status": "ok", "identity": identity })))
}

pub(crate) async fn delete(
    State(state): State<AdminState>,
    body: std::result::Result<Json<IdRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = payload(body)?;
    state.identities.delete(req.id.trim())?;
    Ok(Json(json!({ "status": "ok", "id": req.id.trim() })))
}

#[derive(Deserialize)]
pub(crate) struct TemplateQuery {
    #[serde(default)]
    name: Option<String>,
}

pub(crate) async fn template(Query(query): Query<TemplateQuery>) -> ApiResult<Json<Value>> {
    let name = query
        .name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| Error::Validation("template name is required".to_string()))?;
    let template =
        identities::template(&name).ok_or_else(|| Error::NotFound(format!("template '{}'", name)))?;
    Ok(Json(json!({ "status": "ok", "template": template })))
}

#[cfg(test)]
mod tests {
    use super::super::tests::app;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_starts_with_default_and_templates() {
        let app = app();
        let (status, body) = app.get("/api/identities/list").await;
        assert_eq!(status, StatusCode::OK);
        let identities = body["identities"].as_array().unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0]["id"], "default");
        assert_eq!(identities[0]["is_active"], true);
        let templates: Vec<&str> = body["templates"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert_eq!(templates, vec!["car-sales", "receptionist"]);
    }

    #[tokio::test]
    async fn test_save_activate_delete_flow() {
        let app = app();
        let (status, body) = app
            .post(
                "/api/identities/save",
                json!({"name": "Pirate", "soul_md": "Arr, speak like a pirate."}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        let id = body["identity"]["id"].as_str().unwrap().to_string();
        assert!(id.starts_with("identity_"));
        assert_eq!(body["identity"]["is_active"], false);

        let (status, _) = app.post("/api/identities/activate", json!({"id": id})).await;
        assert_eq!(status, StatusCode::OK);
        let soul = std::fs::read_to_string(app.workspace().join("SOUL.md")).unwrap();
        assert_eq!(soul, "Arr, speak like a pirate.");

        // Active identities are protected.
        let (status, body) = app.post("/api/identities/delete", json!({"id": id})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");

        let (status, body) = app
            .post("/api/identities/save", json!({"name": "Second"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let second = body["identity"]["id"].as_str().unwrap().to_string();
        app.post("/api/identities/activate", json!({"id": second})).await;

        let (status, _) = app.post("/api/identities/delete", json!({"id": id})).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.post("/api/identities/delete", json!({"id": id})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_save_requires_name() {
        let app = app();
        let (status, body) = app.post("/api/identities/save", json!({"soul_md": "x"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("name"));
    }

    #[tokio::test]
    async fn test_template_lookup() {
        let app = app();
        let (status, body) = app.get("/api/identities/template?name=receptionist").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["template"]["name"], "Professional Receptionist");
        assert!(!body["template"]["soul_md"].as_str().unwrap().is_empty());

        let (status, _) = app.get("/api/identities/template").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = app.get("/api/identities/template?name=astronaut").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
