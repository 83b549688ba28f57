//! User and profile handlers. Thin: validate input, call the store, map errors.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use tracing::info;

use super::AppState;
use crate::service::auth::AuthFailure;
use crate::service::context::Principal;
use crate::service::error::ApiError;
use crate::service::store::{NewUser, ProfileUpdate, User};

/// Principal attached by the auth stage, or 401 if the route was mounted
/// without it.
fn require_principal(principal: Option<Extension<Principal>>) -> Result<Principal, ApiError> {
    principal
        .map(|Extension(p)| p)
        .ok_or(ApiError::Unauthorized(AuthFailure::Missing))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<User>, ApiError> {
    let user = state.store.get_user(&id).await?;
    info!(user_id = %user.id, "User retrieved");
    Ok(Json(user))
}

pub async fn create_user(
    State(state): State<AppState>,
    body: Result<Json<NewUser>, JsonRejection>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let Json(new_user) = body.map_err(|e| ApiError::from_rejection(&e))?;

    let missing: Vec<&str> = [
        ("username", &new_user.username),
        ("email", &new_user.email),
        ("name", &new_user.name),
    ]
    .into_iter()
    .filter(|(_, v)| v.trim().is_empty())
    .map(|(field, _)| field)
    .collect();
    if !missing.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "missing required: {}",
            missing.join(", ")
        )));
    }

    let user = state.store.create_user(new_user).await?;
    info!(user_id = %user.id, "User created");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn get_profile(
    State(state): State<AppState>,
    principal: Option<Extension<Principal>>,
) -> Result<Json<User>, ApiError> {
    let principal = require_principal(principal)?;
    let user = state.store.get_profile(&principal).await?;
    info!(user_id = %user.id, "Profile retrieved");
    Ok(Json(user))
}

pub async fn update_profile(
    State(state): State<AppState>,
    principal: Option<Extension<Principal>>,
    body: Result<Json<ProfileUpdate>, JsonRejection>,
) -> Result<Json<User>, ApiError> {
    let principal = require_principal(principal)?;
    let Json(update) = body.map_err(|e| ApiError::from_rejection(&e))?;
    let user = state.store.update_profile(&principal, update).await?;
    info!(user_id = %user.id, "Profile updated");
    Ok(Json(user))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http;
    use axum::routing::{get, post};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::network::ReadinessGate;
    use crate::service::store::MemoryProfileStore;
    use crate::telemetry::HttpMetrics;

    fn app(principal: Option<Principal>) -> Router {
        let state = AppState {
            readiness: Arc::new(ReadinessGate::new()),
            metrics: Arc::new(HttpMetrics::new().unwrap()),
            store: Arc::new(MemoryProfileStore::new()),
        };
        let router = Router::new()
            .route("/api/v1/users", post(create_user))
            .route("/api/v1/users/profile", get(get_profile).put(update_profile))
            .route("/api/v1/users/{id}", get(get_user));
        let router = match principal {
            Some(p) => router.layer(Extension(p)),
            None => router,
        };
        router.with_state(state)
    }

    fn json_request(method: &str, uri: &str, body: &str) -> http::Request<Body> {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_owned()))
            .unwrap()
    }

    async fn send(app: Router, req: http::Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn create_then_fetch_user() {
        let app = app(None);
        let (status, created) = send(
            app.clone(),
            json_request(
                "POST",
                "/api/v1/users",
                r#"{"username":"ada","email":"ada@example.com","name":"Ada"}"#,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_owned();

        let (status, fetched) = send(
            app,
            http::Request::get(format!("/api/v1/users/{id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["username"], "ada");
    }

    #[tokio::test]
    async fn create_rejects_blank_fields() {
        let (status, body) = send(
            app(None),
            json_request("POST", "/api/v1/users", r#"{"username":"","email":"a@b","name":" "}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "missing required: username, name" }));
    }

    #[tokio::test]
    async fn undecodable_body_is_sanitized() {
        let (status, body) = send(
            app(None),
            json_request("POST", "/api/v1/users", r#"{"username":42}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Invalid request" }));
    }

    #[tokio::test]
    async fn invalid_email_and_duplicates() {
        let app = app(None);
        let (status, _) = send(
            app.clone(),
            json_request("POST", "/api/v1/users", r#"{"username":"x","email":"nope","name":"X"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let body = r#"{"username":"x","email":"x@example.com","name":"X"}"#;
        send(app.clone(), json_request("POST", "/api/v1/users", body)).await;
        let (status, err) = send(app, json_request("POST", "/api/v1/users", body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err, json!({ "error": "User already exists" }));
    }

    #[tokio::test]
    async fn unknown_user_is_404() {
        let (status, body) = send(
            app(None),
            http::Request::get("/api/v1/users/999").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "User not found" }));
    }

    #[tokio::test]
    async fn profile_requires_principal() {
        let (status, body) = send(
            app(None),
            http::Request::get("/api/v1/users/profile").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({ "error": "Authentication required" }));
    }

    #[tokio::test]
    async fn profile_update_then_read() {
        let principal = Principal {
            id: "55".to_string(),
            username: "grace".to_string(),
            email: "grace@example.com".to_string(),
        };
        let app = app(Some(principal));

        let (status, updated) = send(
            app.clone(),
            json_request("PUT", "/api/v1/users/profile", r#"{"name":"Grace H","phone":"555"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "Grace H");

        let (status, profile) = send(
            app,
            http::Request::get("/api/v1/users/profile").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["id"], "55");
        assert_eq!(profile["phone"], "555");
    }
}
