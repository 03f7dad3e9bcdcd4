/// Router-level tests of authentication and role checks.
/// The pool connects lazily and is never touched: every request here is
/// decided by the token, the caches and the role rules before any query runs.
use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use rust_leads_api::api::routes::{api_routes, app};
use rust_leads_api::auth::{issue_token, token_digest, UserStatus};
use rust_leads_api::config::Config;
use rust_leads_api::handlers::AppState;
use rust_leads_api::models::{Role, User};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "router-test-secret-0123456789";

fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/never_connected".to_string(),
        port: 0,
        jwt_secret: SECRET.to_string(),
        jwt_expiry_hours: 1,
        privileged_org_name: "Reddington".to_string(),
        request_timeout_secs: 10,
        rate_limit_per_second: 20,
        rate_limit_burst: 50,
        event_channel_capacity: 16,
    }
}

fn test_state() -> Arc<AppState> {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://localhost/never_connected")
        .expect("lazy pool");
    Arc::new(AppState::new(pool, test_config()))
}

fn router(state: Arc<AppState>) -> Router {
    app(state, api_routes())
}

/// Issue a token for a fresh user of `role` and mark them active in the cache.
async fn login_as(state: &AppState, role: Role) -> String {
    let user = User {
        id: Uuid::new_v4(),
        name: format!("{} user", role),
        email: format!("{}@example.com", role),
        password_hash: String::new(),
        role,
        organization_id: (role != Role::Superadmin).then(Uuid::new_v4),
        is_active: true,
        last_login: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    state
        .user_status_cache
        .insert(user.id, Some(UserStatus::of(&user)))
        .await;
    issue_token(&user, SECRET, 1).unwrap()
}

fn request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::from("{}")).unwrap()
}

async fn send(state: Arc<AppState>, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router(state).oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, body)
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let (status, body) = send(test_state(), request(Method::GET, "/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let (status, body) = send(test_state(), request(Method::GET, "/api/leads", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_garbage_token_is_unauthorized() {
    let (status, _) = send(
        test_state(),
        request(Method::GET, "/api/leads", Some("not-a-jwt")),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_signed_with_other_secret_is_unauthorized() {
    let state = test_state();
    let user = User {
        id: Uuid::new_v4(),
        name: "Mallory".to_string(),
        email: "mallory@example.com".to_string(),
        password_hash: String::new(),
        role: Role::Superadmin,
        organization_id: None,
        is_active: true,
        last_login: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let forged = issue_token(&user, "some-other-secret-9876543210", 1).unwrap();

    let (status, _) = send(state, request(Method::GET, "/api/auth/admins", Some(&forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_follow_up_agent_on_admin_endpoints_is_forbidden() {
    let state = test_state();
    let token = login_as(&state, Role::Agent2).await;

    for (method, uri) in [
        (Method::GET, "/api/leads/available-agents".to_string()),
        (Method::GET, "/api/auth/admins".to_string()),
        (Method::GET, "/api/auth/agents".to_string()),
        (Method::GET, "/api/organizations".to_string()),
        (Method::DELETE, format!("/api/leads/{}", Uuid::new_v4())),
        (Method::POST, format!("/api/leads/{}/unassign", Uuid::new_v4())),
    ] {
        let (status, body) = send(state.clone(), request(method.clone(), &uri, Some(&token))).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{} {}", method, uri);
        assert_eq!(body["success"], false);
    }
}

#[tokio::test]
async fn test_lead_entry_agent_cannot_update_leads() {
    let state = test_state();
    let token = login_as(&state, Role::Agent1).await;

    let uri = format!("/api/leads/{}", Uuid::new_v4());
    let (status, _) = send(state, request(Method::PUT, &uri, Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_follow_up_agent_cannot_create_leads() {
    let state = test_state();
    let token = login_as(&state, Role::Agent2).await;

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/leads")
        .header("content-type", "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::from(r#"{"name":"Jane Roe","phone":"2025550123"}"#))
        .unwrap();
    let (status, _) = send(state, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_is_forbidden_on_superadmin_endpoints() {
    let state = test_state();
    let token = login_as(&state, Role::Admin).await;

    let uri = format!("/api/organizations/{}", Uuid::new_v4());
    let (status, _) = send(state.clone(), request(Method::DELETE, &uri, Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let uri = format!("/api/auth/users/{}", Uuid::new_v4());
    let (status, _) = send(state, request(Method::PUT, &uri, Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_logged_out_token_is_unauthorized() {
    let state = test_state();
    let token = login_as(&state, Role::Admin).await;

    let (status, _) = send(state.clone(), request(Method::POST, "/api/auth/logout", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(state.revoked_tokens.contains_key(&token_digest(&token)));

    let (status, _) = send(state, request(Method::GET, "/api/leads/available-agents", Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_deactivated_user_is_unauthorized_with_valid_token() {
    let state = test_state();
    let token = login_as(&state, Role::Agent2).await;
    let claims = rust_leads_api::auth::decode_token(&token, SECRET).unwrap();
    let mut current = state.user_status_cache.get(&claims.sub).await.flatten().unwrap();
    current.is_active = false;
    state.user_status_cache.insert(claims.sub, Some(current)).await;

    let (status, _) = send(state, request(Method::GET, "/api/auth/admins", Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_issued_before_role_change_is_unauthorized() {
    let state = test_state();
    let token = login_as(&state, Role::Admin).await;
    let claims = rust_leads_api::auth::decode_token(&token, SECRET).unwrap();

    // Demoted to agent2 after the token was issued.
    state
        .user_status_cache
        .insert(
            claims.sub,
            Some(UserStatus {
                is_active: true,
                role: Role::Agent2,
                organization_id: claims.org,
            }),
        )
        .await;

    let (status, body) = send(state, request(Method::GET, "/api/auth/agents", Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.to_string().contains("log in again"));
}

#[tokio::test]
async fn test_deleted_account_token_is_unauthorized() {
    let state = test_state();
    let token = login_as(&state, Role::Agent1).await;
    let claims = rust_leads_api::auth::decode_token(&token, SECRET).unwrap();
    state.user_status_cache.insert(claims.sub, None).await;

    let (status, _) = send(state, request(Method::GET, "/api/leads/available-agents", Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_socket_requires_valid_token() {
    let (status, _) = send(test_state(), request(Method::GET, "/socket", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        test_state(),
        request(Method::GET, "/socket?token=bogus", None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
