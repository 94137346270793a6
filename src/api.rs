use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Deserializer};
use tokio::sync::broadcast;

use crate::advisory::{Advisory, Candidate};
use crate::auth::{self, AuthContext};
use crate::db::{DbHandle, IssueFilter, IssuePatch, NewIssue, UserPatch};
use crate::errors::ApiError;
use crate::models::{IssuePage, IssueSeverity, IssueStatus, Role, User};
use crate::policy::{self, Action};
use crate::ws::{WsMessage, broadcast_message};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub advisory: Advisory,
    pub auth: AuthContext,
    pub uploads_dir: PathBuf,
}

pub type SharedState = Arc<AppState>;

// ── Authenticated user extractor ──────────────────────────────────────

/// The requesting user, resolved from the bearer token. The role comes
/// from the database row, not the token, so demotions and deactivations
/// take effect immediately.
pub struct CurrentUser(pub User);

impl axum::extract::FromRequestParts<SharedState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let header_value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Authentication("Not authenticated".to_string()))?;
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::Authentication("Not authenticated".to_string()))?;

        let claims = state.auth.verify_token(token)?;
        let user = state
            .db
            .call(move |db| db.get_user(claims.sub))
            .await?
            .ok_or_else(|| ApiError::Authentication("Could not validate credentials".to_string()))?;
        if !user.is_active {
            return Err(ApiError::Forbidden("Inactive user".to_string()));
        }
        Ok(CurrentUser(user))
    }
}

// ── Upload rules ───────────────────────────────────────────────────────

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "jpg", "jpeg", "png", "gif", "doc", "docx", "txt"];

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 100;
const DEFAULT_DAILY_DAYS: i64 = 7;
const MAX_DAILY_DAYS: i64 = 90;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
}

#[derive(Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub full_name: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
pub struct ListIssuesQuery {
    pub status: Option<IssueStatus>,
    pub severity: Option<IssueSeverity>,
    pub search: Option<String>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct UpdateIssueRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Option<IssueSeverity>,
    pub status: Option<IssueStatus>,
    pub tags: Option<String>,
    /// Missing means leave unchanged, `null` clears the assignee.
    #[serde(default, deserialize_with = "double_option")]
    pub assignee_id: Option<Option<i64>>,
}

#[derive(Deserialize)]
pub struct DailyStatsQuery {
    pub days: Option<i64>,
}

#[derive(Deserialize)]
pub struct ClassifyRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(de).map(Some)
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .route("/api/users", get(list_users))
        .route("/api/users/{id}", put(update_user))
        .route("/api/issues", get(list_issues).post(create_issue))
        .route(
            "/api/issues/{id}",
            get(get_issue).put(update_issue).delete(delete_issue),
        )
        .route("/api/dashboard/stats", get(dashboard_stats))
        .route("/api/dashboard/daily-stats", get(daily_stats))
        .route("/api/ai/classify", post(ai_classify))
        .route("/api/ai/chat", post(ai_chat))
        .route("/api/ai/predict-resolution/{id}", get(ai_predict_resolution))
        .route("/api/ai/suggest-assignee/{id}", get(ai_suggest_assignee))
        .route("/uploads/{file}", get(serve_upload))
        .route("/health", get(health_check))
        // Body limit leaves headroom above the attachment cap so the size
        // check below produces a 400 instead of an opaque 413.
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 1024 * 1024))
}

// ── Auth handlers ─────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let database = match state.db.call(|db| db.ping()).await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::error!(error = %e, "health check database ping failed");
            "unavailable"
        }
    };
    let status = if database == "ok" { "ok" } else { "degraded" };
    Json(serde_json::json!({
        "status": status,
        "services": {
            "database": database,
            "advisory": state.advisory.mode(),
        },
    }))
}

async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    if !email.contains('@') || email.len() < 3 {
        return Err(ApiError::Validation("Invalid email address".to_string()));
    }
    if req.password.len() < auth::MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "Password must be at least {} characters",
            auth::MIN_PASSWORD_LEN
        )));
    }
    let full_name = req.full_name.trim().to_string();
    if full_name.is_empty() {
        return Err(ApiError::Validation("Full name is required".to_string()));
    }

    let hash = auth::hash_password(&req.password)?;
    let user = state
        .db
        .call(move |db| db.create_user(&email, &hash, &full_name, Role::Reporter))
        .await?
        .ok_or_else(|| ApiError::Conflict("Email already registered".to_string()))?;

    tracing::info!(user_id = user.id, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login(
    State(state): State<SharedState>,
    Form(form): Form<LoginForm>,
) -> Result<impl IntoResponse, ApiError> {
    let email = form.username.trim().to_lowercase();
    let found = state.db.call(move |db| db.get_user_auth(&email)).await?;

    let (user, stored_hash) = found.ok_or_else(|| {
        ApiError::Authentication("Incorrect email or password".to_string())
    })?;
    if !auth::verify_password(&form.password, &stored_hash) {
        return Err(ApiError::Authentication(
            "Incorrect email or password".to_string(),
        ));
    }
    if !user.is_active {
        return Err(ApiError::Forbidden("Inactive user".to_string()));
    }

    let token = state.auth.issue_token(&user)?;
    Ok(Json(serde_json::json!({
        "access_token": token,
        "token_type": "bearer",
    })))
}

async fn me(CurrentUser(user): CurrentUser) -> Json<User> {
    Json(user)
}

// ── User admin handlers ───────────────────────────────────────────────

async fn list_users(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    policy::require(user.role, Action::ListUsers)?;
    let users = state.db.call(|db| db.list_users()).await?;
    Ok(Json(users))
}

async fn update_user(
    State(state): State<SharedState>,
    CurrentUser(actor): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    policy::require(actor.role, Action::ManageUsers)?;

    let patch = UserPatch {
        full_name: req.full_name,
        role: req.role,
        is_active: req.is_active,
    };
    let updated = state
        .db
        .call(move |db| db.update_user(id, &patch))
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
    tracing::info!(user_id = id, actor_id = actor.id, "user updated");
    Ok(Json(updated))
}

// ── Issue handlers ────────────────────────────────────────────────────

async fn create_issue(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    policy::require(user.role, Action::CreateIssue)?;

    let mut title = String::new();
    let mut description = String::new();
    let mut severity = IssueSeverity::Medium;
    let mut tags: Option<String> = None;
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("Invalid form data: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "title" => {
                title = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?
                    .trim()
                    .to_string();
            }
            "description" => {
                description = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?
                    .trim()
                    .to_string();
            }
            "severity" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                severity = raw.parse().map_err(ApiError::Validation)?;
            }
            "tags" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::Validation(e.to_string()))?;
                if !raw.trim().is_empty() {
                    tags = Some(raw.trim().to_string());
                }
            }
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                if file_name.is_empty() {
                    continue;
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::Validation(format!("Failed to read file: {}", e)))?;
                upload = Some((file_name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    if title.is_empty() {
        return Err(ApiError::Validation("Title is required".to_string()));
    }
    if description.is_empty() {
        return Err(ApiError::Validation("Description is required".to_string()));
    }

    let (file_path, file_name) = match upload {
        Some((original_name, bytes)) => {
            let stored = store_attachment(&state.uploads_dir, &original_name, &bytes).await?;
            (Some(stored), Some(original_name))
        }
        None => (None, None),
    };

    let new = NewIssue {
        title,
        description,
        severity,
        tags,
        file_path,
        file_name,
        reporter_id: user.id,
    };
    let issue = state.db.call(move |db| db.create_issue(&new)).await?;

    broadcast_message(
        &state.ws_tx,
        &WsMessage::IssueCreated {
            id: issue.id,
            title: issue.title.clone(),
            reporter: user.full_name.clone(),
            severity: issue.severity.as_str().to_string(),
            created_at: issue.created_at.clone(),
        },
    );
    tracing::info!(issue_id = issue.id, reporter_id = user.id, "issue created");
    Ok((StatusCode::CREATED, Json(issue)))
}

/// Validate and persist an attachment under a random name, returning the
/// stored file name.
async fn store_attachment(
    uploads_dir: &std::path::Path,
    original_name: &str,
    bytes: &[u8],
) -> Result<String, ApiError> {
    let extension = std::path::Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .ok_or_else(|| ApiError::Validation("File has no extension".to_string()))?;
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ApiError::Validation(format!(
            "File type '.{}' is not allowed",
            extension
        )));
    }
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(ApiError::Validation(
            "File exceeds the 10 MB limit".to_string(),
        ));
    }

    let stored = format!("{}.{}", uuid::Uuid::new_v4(), extension);
    tokio::fs::create_dir_all(uploads_dir)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to create uploads dir: {}", e)))?;
    tokio::fs::write(uploads_dir.join(&stored), bytes)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to store attachment: {}", e)))?;
    Ok(stored)
}

async fn list_issues(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<ListIssuesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let skip = query.skip.unwrap_or(0).max(0);

    // Reporters only ever see their own issues, whatever they ask for.
    let reporter_id = if policy::allows(user.role, Action::ReadAnyIssue) {
        None
    } else {
        Some(user.id)
    };

    let filter = IssueFilter {
        reporter_id,
        status: query.status,
        severity: query.severity,
        search: query.search.filter(|s| !s.trim().is_empty()),
        skip,
        limit,
    };
    let (items, total) = state.db.call(move |db| db.list_issues(&filter)).await?;

    Ok(Json(IssuePage {
        items,
        total,
        page: skip / limit + 1,
        per_page: limit,
        total_pages: (total + limit - 1) / limit,
    }))
}

async fn get_issue(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .db
        .call(move |db| db.get_issue(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;
    if issue.reporter_id != user.id {
        policy::require(user.role, Action::ReadAnyIssue)?;
    }
    Ok(Json(issue))
}

async fn update_issue(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
    Json(req): Json<UpdateIssueRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let existing = state
        .db
        .call(move |db| db.get_issue(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;

    let patch = IssuePatch {
        title: req.title.map(|t| t.trim().to_string()),
        description: req.description,
        severity: req.severity,
        status: req.status,
        tags: req.tags,
        assignee_id: req.assignee_id,
    };
    if let Some(title) = &patch.title {
        if title.is_empty() {
            return Err(ApiError::Validation("Title cannot be empty".to_string()));
        }
    }

    let fields = patch.field_names();
    policy::check_issue_update(user.id, user.role, &existing, &fields)?;

    // An assignee must be someone who can actually work the issue.
    if let Some(Some(assignee_id)) = patch.assignee_id {
        let assignee = state
            .db
            .call(move |db| db.get_user(assignee_id))
            .await?
            .ok_or_else(|| ApiError::Validation("Assignee not found".to_string()))?;
        if !assignee.is_active || !policy::allows(assignee.role, Action::TriageIssue) {
            return Err(ApiError::Validation(
                "Assignee must be an active maintainer or admin".to_string(),
            ));
        }
    }

    let updated = state
        .db
        .call(move |db| db.update_issue(id, &patch))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;

    let status_changed = fields.contains(&"status") && existing.status != updated.status;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::IssueUpdated {
            id: updated.id,
            title: updated.title.clone(),
            summary: fields.join(", "),
            old_status: status_changed.then_some(existing.status),
            new_status: status_changed.then_some(updated.status),
            updated_by: user.full_name.clone(),
        },
    );
    tracing::info!(issue_id = id, actor_id = user.id, "issue updated");
    Ok(Json(updated))
}

async fn delete_issue(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    policy::require(user.role, Action::DeleteIssue)?;

    let deleted = state
        .db
        .call(move |db| db.delete_issue(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;

    // Attachment cleanup is best effort; the row is already gone.
    if let Some(stored) = &deleted.file_path {
        let _ = tokio::fs::remove_file(state.uploads_dir.join(stored)).await;
    }

    broadcast_message(
        &state.ws_tx,
        &WsMessage::IssueDeleted {
            id: deleted.id,
            title: deleted.title.clone(),
        },
    );
    tracing::info!(issue_id = id, actor_id = user.id, "issue deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Dashboard handlers ────────────────────────────────────────────────

fn dashboard_scope(user: &User) -> Option<i64> {
    if policy::allows(user.role, Action::ViewTeamDashboard) {
        None
    } else {
        Some(user.id)
    }
}

async fn dashboard_stats(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let scope = dashboard_scope(&user);
    let stats = state.db.call(move |db| db.dashboard_stats(scope)).await?;
    Ok(Json(stats))
}

async fn daily_stats(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Query(query): Query<DailyStatsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let days = query
        .days
        .unwrap_or(DEFAULT_DAILY_DAYS)
        .clamp(1, MAX_DAILY_DAYS);
    let scope = dashboard_scope(&user);
    let stats = state
        .db
        .call(move |db| db.daily_counts(days, scope))
        .await?;
    Ok(Json(stats))
}

// ── AI advisory handlers ──────────────────────────────────────────────

async fn ai_classify(
    State(state): State<SharedState>,
    CurrentUser(_user): CurrentUser,
    Json(req): Json<ClassifyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.title.trim().is_empty() {
        return Err(ApiError::Validation("Title is required".to_string()));
    }
    let classification = state.advisory.classify(&req.title, &req.description).await;
    Ok(Json(classification))
}

async fn ai_chat(
    State(state): State<SharedState>,
    CurrentUser(_user): CurrentUser,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::Validation("Message is required".to_string()));
    }
    let reply = state.advisory.chat(&req.message).await;
    Ok(Json(reply))
}

async fn ai_predict_resolution(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let issue = state
        .db
        .call(move |db| db.get_issue(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;
    if issue.reporter_id != user.id {
        policy::require(user.role, Action::ReadAnyIssue)?;
    }
    let prediction = state.advisory.predict_resolution(&issue).await;
    Ok(Json(prediction))
}

async fn ai_suggest_assignee(
    State(state): State<SharedState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    policy::require(user.role, Action::TriageIssue)?;

    let issue = state
        .db
        .call(move |db| db.get_issue(id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Issue not found".to_string()))?;
    let candidates: Vec<Candidate> = state
        .db
        .call(|db| db.assignment_candidates())
        .await?
        .into_iter()
        .map(|(user, open_assigned)| Candidate { user, open_assigned })
        .collect();

    let suggestion = state.advisory.suggest_assignee(&issue, &candidates).await;
    Ok(Json(suggestion))
}

// ── Attachment serving ────────────────────────────────────────────────

async fn serve_upload(
    State(state): State<SharedState>,
    Path(file): Path<String>,
) -> Result<Response, ApiError> {
    // Stored names are uuid.ext; anything else is not ours to serve.
    if file.contains("..") || file.contains('/') || file.contains('\\') {
        return Err(ApiError::Validation("Invalid file name".to_string()));
    }
    let path = state.uploads_dir.join(&file);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::NotFound("File not found".to_string()))?;
    let mime = mime_guess::from_path(&file).first_or_octet_stream();
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, mime.as_ref().to_string())],
        bytes,
    )
        .into_response())
}

// ── Tests ─────────────────────────────────────────────────────────────
