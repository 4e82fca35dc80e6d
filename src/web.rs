//! The HTTP frontend: a JSON API over the engine for administration and
//! self-service. Requests authenticate with HTTP basic auth against the
//! directory itself; mutations additionally require the `is_admin`
//! permission and run with seed conflicts reported as errors, so pinned
//! fields surface as 422 responses instead of being silently reverted.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use base64ct::{Base64, Encoding};
use miette::IntoDiagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::crypt;
use crate::database::{Group, Permissions, PosixAttributes, User};
use crate::engine::{Engine, UserWithPerms};
use crate::nexus::UpdateOptions;
use crate::settings::Settings;
use crate::validation::{FieldRef, ValidationError};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub engine: Engine,
}

// mutations through the API must not fight the seed silently
const STRICT: UpdateOptions = UpdateOptions { conflict_with_seed_is_error: true };

async fn security_headers(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    if state.settings.server_http_secure {
        headers.insert(
            HeaderName::from_static("strict-transport-security"),
            HeaderValue::from_static("max-age=31536000"),
        );
    }
    response
}

pub async fn serve(settings: Arc<Settings>, engine: Engine) -> miette::Result<()> {
    let state = AppState { settings: settings.clone(), engine };

    let router = Router::new()
        .route("/api/v1/users", get(list_users).post(create_user))
        .route(
            "/api/v1/users/{login_name}",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/api/v1/groups", get(list_groups).post(create_group))
        .route(
            "/api/v1/groups/{name}",
            get(get_group).put(update_group).delete(delete_group),
        )
        .route("/api/v1/self", get(get_self))
        .route("/api/v1/self/password", put(change_own_password))
        .layer(middleware::from_fn_with_state(state.clone(), security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&settings.server_http_listen)
        .await
        .into_diagnostic()?;
    tracing::info!(listen = %settings.server_http_listen, "HTTP frontend listening");
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"portunus\"")],
        "authentication required",
    )
        .into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "admin permission required").into_response()
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn validation_failed(errors: Vec<ValidationError>) -> Response {
    (StatusCode::UNPROCESSABLE_ENTITY, Json(errors)).into_response()
}

/// Resolves the basic-auth credentials against the directory.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<UserWithPerms, Response> {
    let credentials = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| Base64::decode_vec(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .ok_or_else(unauthorized)?;
    let (login_name, password) = credentials.split_once(':').ok_or_else(unauthorized)?;

    let view = state.engine.find_user(login_name).ok_or_else(unauthorized)?;
    if !crypt::verify_password(password, &view.user.password_hash) {
        return Err(unauthorized());
    }
    Ok(view)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<UserWithPerms, Response> {
    let view = authenticate(state, headers)?;
    if !view.perms.is_admin {
        return Err(forbidden());
    }
    Ok(view)
}

/// What the API reveals about a user: the record minus the password hash,
/// plus the derived membership view.
#[derive(Debug, Serialize)]
struct UserResponse {
    login_name: String,
    given_name: String,
    family_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_public_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    posix: Option<PosixAttributes>,
    group_memberships: Vec<String>,
    perms: Permissions,
}

impl From<UserWithPerms> for UserResponse {
    fn from(view: UserWithPerms) -> Self {
        UserResponse {
            login_name: view.user.login_name,
            given_name: view.user.given_name,
            family_name: view.user.family_name,
            email: view.user.email,
            ssh_public_keys: view.user.ssh_public_keys,
            posix: view.user.posix,
            group_memberships: view.group_memberships.into_iter().map(|g| g.name).collect(),
            perms: view.perms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login_name: String,
    given_name: String,
    family_name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    ssh_public_keys: Vec<String>,
    /// Plaintext password, hashed server-side. Mutually exclusive with
    /// `password_hash`.
    #[serde(default)]
    password: Option<String>,
    /// Pre-hashed crypt-style blob, stored verbatim.
    #[serde(default)]
    password_hash: Option<String>,
    #[serde(default)]
    posix: Option<PosixAttributes>,
}

impl UserPayload {
    /// The hash this payload asks for, or `None` to keep the current one.
    fn new_password_hash(&self) -> Result<Option<String>, Response> {
        if let Some(password) = &self.password {
            let hash = crypt::hash_password(password).map_err(|err| {
                tracing::error!(%err, "password hashing failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })?;
            return Ok(Some(hash));
        }
        Ok(self.password_hash.clone())
    }
}

#[derive(Debug, Deserialize)]
struct GroupPayload {
    name: String,
    long_name: String,
    #[serde(default)]
    member_login_names: BTreeSet<String>,
    #[serde(default)]
    posix_gid: Option<u16>,
    #[serde(default)]
    permissions: Permissions,
}

async fn list_users(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match require_admin(&state, &headers) {
        Ok(_) => {
            let users: Vec<UserResponse> =
                state.engine.list_users().into_iter().map(Into::into).collect();
            Json(users).into_response()
        }
        Err(response) => response,
    }
}

async fn get_user(
    State(state): State<AppState>,
    Path(login_name): Path<String>,
    headers: HeaderMap,
) -> Response {
    let view = match authenticate(&state, &headers) {
        Ok(view) => view,
        Err(response) => return response,
    };
    // everyone may read themselves, everything else is admin-only
    if view.user.login_name != login_name && !view.perms.is_admin {
        return forbidden();
    }
    match state.engine.find_user(&login_name) {
        Some(found) => Json(UserResponse::from(found)).into_response(),
        None => not_found(),
    }
}

async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UserPayload>,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    let password_hash = match payload.new_password_hash() {
        Ok(hash) => hash.unwrap_or_default(),
        Err(response) => return response,
    };
    let user = User {
        login_name: payload.login_name,
        given_name: payload.given_name,
        family_name: payload.family_name,
        email: payload.email,
        ssh_public_keys: payload.ssh_public_keys,
        password_hash,
        posix: payload.posix,
    };
    match state.engine.create_user(user, STRICT) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(errors) => validation_failed(errors),
    }
}

async fn update_user(
    State(state): State<AppState>,
    Path(login_name): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<UserPayload>,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    if payload.login_name != login_name {
        return validation_failed(vec![
            FieldRef::user(&login_name, "login_name").error("cannot be changed")
        ]);
    }
    let new_hash = match payload.new_password_hash() {
        Ok(hash) => hash,
        Err(response) => return response,
    };
    let result = state.engine.change_user(
        &login_name,
        move |mut user| {
            user.given_name = payload.given_name;
            user.family_name = payload.family_name;
            user.email = payload.email;
            user.ssh_public_keys = payload.ssh_public_keys;
            user.posix = payload.posix;
            if let Some(hash) = new_hash {
                user.password_hash = hash;
            }
            Ok(Some(user))
        },
        STRICT,
    );
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(errors) => validation_failed(errors),
    }
}

async fn delete_user(
    State(state): State<AppState>,
    Path(login_name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    match state.engine.delete_user(&login_name, STRICT) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(errors) => validation_failed(errors),
    }
}

async fn list_groups(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match require_admin(&state, &headers) {
        Ok(_) => Json(state.engine.list_groups()).into_response(),
        Err(response) => response,
    }
}

async fn get_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    match state.engine.find_group(&name) {
        Some(group) => Json(group).into_response(),
        None => not_found(),
    }
}

async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GroupPayload>,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    let group = Group {
        name: payload.name,
        long_name: payload.long_name,
        member_login_names: payload.member_login_names,
        posix_gid: payload.posix_gid,
        permissions: payload.permissions,
    };
    match state.engine.create_group(group, STRICT) {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(errors) => validation_failed(errors),
    }
}

async fn update_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<GroupPayload>,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    if payload.name != name {
        return validation_failed(vec![FieldRef::group(&name, "name").error("cannot be changed")]);
    }
    let result = state.engine.change_group(
        &name,
        move |mut group| {
            group.long_name = payload.long_name;
            group.member_login_names = payload.member_login_names;
            group.posix_gid = payload.posix_gid;
            group.permissions = payload.permissions;
            Ok(Some(group))
        },
        STRICT,
    );
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(errors) => validation_failed(errors),
    }
}

async fn delete_group(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    match state.engine.delete_group(&name, STRICT) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(errors) => validation_failed(errors),
    }
}

async fn get_self(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match authenticate(&state, &headers) {
        Ok(view) => Json(UserResponse::from(view)).into_response(),
        Err(response) => response,
    }
}

#[derive(Debug, Deserialize)]
struct PasswordChange {
    current_password: String,
    new_password: String,
}

async fn change_own_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(change): Json<PasswordChange>,
) -> Response {
    let view = match authenticate(&state, &headers) {
        Ok(view) => view,
        Err(response) => return response,
    };
    if !crypt::verify_password(&change.current_password, &view.user.password_hash) {
        return validation_failed(vec![
            FieldRef::user(&view.user.login_name, "password").error("does not match")
        ]);
    }
    let new_hash = match crypt::hash_password(&change.new_password) {
        Ok(hash) => hash,
        Err(err) => {
            tracing::error!(%err, "password hashing failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let result = state.engine.change_user(
        &view.user.login_name,
        move |mut user| {
            user.password_hash = new_hash;
            Ok(Some(user))
        },
        STRICT,
    );
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(errors) => validation_failed(errors),
    }
}
