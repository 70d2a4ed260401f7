use super::http_errors::{map_account_error, map_analysis_error, map_webhook_error};
use super::state::AppState;
use crate::application::{Entitlement, ScansRemaining, WebhookOutcome};
use crate::domain::{GradeLevel, ImagePayload, LessonPlan, UserRecord};
use crate::infrastructure::UserRepository;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, header::HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

// Multipart uploads; axum's default 2 MB body cap is too small for
// phone photos.
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

const TRIAL_TOKEN_HEADER: &str = "x-trial-token";
const BILLING_SIGNATURE_HEADER: &str = "x-billing-signature";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/user/status", get(user_status))
        .route(
            "/analyze",
            post(analyze).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(
            "/analyze/preview",
            post(analyze_preview).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/webhooks/billing", post(billing_webhook))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
}

fn parse_grade(grade: &str) -> Option<GradeLevel> {
    GradeLevel::from_str(grade.trim()).ok()
}

async fn require_user(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<UserRecord, (StatusCode, Json<serde_json::Value>)> {
    let token = match extract_bearer_token(headers) {
        Some(t) => t,
        None => {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Missing or invalid authorization token"})),
            ));
        }
    };

    match state.accounts.authenticate(token).await {
        Ok(user) => Ok(user),
        Err(e) => {
            let (status, body) = map_account_error(&e);
            if status.is_server_error() {
                error!(error = %e, "Authentication failed");
            }
            Err((status, Json(body)))
        }
    }
}

struct AnalyzeUpload {
    image: ImagePayload,
    grade: Option<GradeLevel>,
}

// Pulls the `file` and optional `grade` parts out of the form. An
// unparseable grade is treated as absent rather than rejecting the
// whole upload.
async fn read_analyze_upload(mut multipart: Multipart) -> Result<AnalyzeUpload, String> {
    let mut image: Option<ImagePayload> = None;
    let mut grade: Option<GradeLevel> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("Unreadable multipart body: {}", e))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let mime_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| format!("Failed to read uploaded file: {}", e))?;
                image = Some(ImagePayload {
                    bytes: bytes.to_vec(),
                    mime_type,
                });
            }
            Some("grade") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| format!("Failed to read grade field: {}", e))?;
                grade = parse_grade(&text);
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| "No file uploaded".to_string())?;
    Ok(AnalyzeUpload { image, grade })
}

fn outcome_label(outcome: &WebhookOutcome) -> &'static str {
    match outcome {
        WebhookOutcome::Applied { .. } => "applied",
        WebhookOutcome::Unchanged { .. } => "unchanged",
        WebhookOutcome::UnknownUser { .. } => "unknown_user",
        WebhookOutcome::Ignored { .. } => "ignored",
    }
}


#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        register,
        login,
        me,
        user_status,
        analyze,
        analyze_preview,
        billing_webhook,
    ),
    components(
        schemas(
            RegisterRequest,
            LoginRequest,
            TokenResponse,
            ProfileResponse,
            StatusResponse,
            QuestionsResponse,
            LessonResponse,
            HealthResponse,
        )
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Accounts", description = "Registration, login and account status"),
        (name = "Analysis", description = "Homework photo analysis"),
        (name = "Billing", description = "Billing provider webhooks"),
    ),
    info(
        title = "Socratic Parent API",
        version = "0.1.0",
        description = "Homework photo analysis that coaches parents with guided questions, never answers",
        license(name = "MIT")
    )
)]
struct ApiDoc;

/// Health check response
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    ai_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    users: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Health check endpoint
///
/// Verifies user store reachability and reports whether AI credentials
/// are configured.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse)
    )
)]
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.users.count().await {
        Ok(users) => (
            StatusCode::OK,
            Json(serde_json::json!(HealthResponse {
                status: "ok".to_string(),
                ai_configured: state.ai_configured,
                users: Some(users),
                error: None,
            })),
        ),
        Err(e) => {
            error!(error = %e, "Health check failed: user store unreadable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!(HealthResponse {
                    status: "unhealthy".to_string(),
                    ai_configured: state.ai_configured,
                    users: None,
                    error: Some("User store unreadable".to_string()),
                })),
            )
        }
    }
}

/// Registration request
#[derive(Deserialize, ToSchema)]
struct RegisterRequest {
    #[schema(example = "ada")]
    username: String,
    #[schema(example = "correct-horse")]
    password: String,
    #[schema(example = "ada@example.com")]
    email: String,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
}

/// Create an account and sign the user in
#[utoipa::path(
    post,
    path = "/register",
    tag = "Accounts",
    request_body = RegisterRequest,
    responses(
        (status = 200, description = "Account created, token issued", body = TokenResponse),
        (status = 400, description = "Validation failed or username taken", body = Object),
        (status = 500, description = "Failed to create account", body = Object)
    )
)]
async fn register(State(state): State<AppState>, Json(req): Json<RegisterRequest>) -> impl IntoResponse {
    match state
        .accounts
        .register(&req.username, &req.password, &req.email)
        .await
    {
        Ok(token) => (
            StatusCode::OK,
            Json(serde_json::json!(TokenResponse { access_token: token })),
        ),
        Err(e) => {
            let (status, body) = map_account_error(&e);
            if status.is_server_error() {
                error!(error = %e, "Failed to register user");
            }
            (status, Json(body))
        }
    }
}

#[derive(Deserialize, ToSchema)]
struct LoginRequest {
    #[schema(example = "ada")]
    username: String,
    password: String,
}

/// Exchange credentials for an access token
#[utoipa::path(
    post,
    path = "/login",
    tag = "Accounts",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token issued", body = TokenResponse),
        (status = 401, description = "Invalid username or password", body = Object),
        (status = 500, description = "Failed to log in", body = Object)
    )
)]
async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> impl IntoResponse {
    match state.accounts.login(&req.username, &req.password).await {
        Ok(token) => (
            StatusCode::OK,
            Json(serde_json::json!(TokenResponse { access_token: token })),
        ),
        Err(e) => {
            let (status, body) = map_account_error(&e);
            if status.is_server_error() {
                error!(error = %e, "Failed to log in user");
            }
            (status, Json(body))
        }
    }
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    username: String,
    email: String,
    is_premium: bool,
}

#[utoipa::path(
    get,
    path = "/me",
    tag = "Accounts",
    responses(
        (status = 200, description = "Current user profile", body = ProfileResponse),
        (status = 401, description = "Invalid or missing authorization token", body = Object)
    )
)]
async fn me(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    (
        StatusCode::OK,
        Json(serde_json::json!(ProfileResponse {
            username: user.username,
            email: user.email,
            is_premium: user.is_premium,
        })),
    )
}

/// Entitlement snapshot; evaluation only, nothing is consumed.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    is_premium: bool,
    /// A number for free accounts, the string `"unlimited"` for premium.
    #[schema(value_type = Object)]
    scans_left: ScansRemaining,
    #[serde(skip_serializing_if = "Option::is_none")]
    resets_at: Option<DateTime<Utc>>,
}

impl From<Entitlement> for StatusResponse {
    fn from(entitlement: Entitlement) -> Self {
        Self {
            is_premium: entitlement.is_premium,
            scans_left: entitlement.remaining,
            resets_at: entitlement.resets_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/user/status",
    tag = "Accounts",
    responses(
        (status = 200, description = "Current scan allowance", body = StatusResponse),
        (status = 401, description = "Invalid or missing authorization token", body = Object)
    )
)]
async fn user_status(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let entitlement = state.accounts.entitlement_for(&user);
    (
        StatusCode::OK,
        Json(serde_json::json!(StatusResponse::from(entitlement))),
    )
}

#[derive(Serialize, ToSchema)]
struct QuestionsResponse {
    foundation: String,
    bridge: String,
    mastery: String,
}

/// Lesson body returned by both analysis routes. `usage` is present on
/// the authenticated route only.
#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct LessonResponse {
    #[schema(example = "Math - Fractions")]
    subject: String,
    questions: QuestionsResponse,
    behavioral_tip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    solution_steps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    example_approach: Option<String>,
    degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    usage: Option<Entitlement>,
}

impl LessonResponse {
    fn new(lesson: LessonPlan, degraded: bool, usage: Option<Entitlement>) -> Self {
        Self {
            subject: lesson.subject,
            questions: QuestionsResponse {
                foundation: lesson.questions.foundation,
                bridge: lesson.questions.bridge,
                mastery: lesson.questions.mastery,
            },
            behavioral_tip: lesson.behavioral_tip,
            solution_steps: lesson.solution_steps,
            example_approach: lesson.example_approach,
            degraded,
            usage,
        }
    }
}

/// Analyze a homework photo
///
/// Consumes one scan from the daily allowance on success, including
/// when the fallback lesson is served.
#[utoipa::path(
    post,
    path = "/analyze",
    tag = "Analysis",
    request_body(
        content = Object,
        content_type = "multipart/form-data",
        description = "`file` = homework photo (image/*); `grade` = optional band: K-2, 3-5, 6-8 or 9-12"
    ),
    responses(
        (status = 200, description = "Lesson generated", body = LessonResponse),
        (status = 400, description = "Missing or invalid upload", body = Object),
        (status = 401, description = "Invalid or missing authorization token", body = Object),
        (status = 402, description = "Daily scan limit reached", body = Object),
        (status = 500, description = "Failed to record scan usage", body = Object)
    )
)]
async fn analyze(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> impl IntoResponse {
    let user = match require_user(&state, &headers).await {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let upload = match read_analyze_upload(multipart).await {
        Ok(upload) => upload,
        Err(msg) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": msg})),
            );
        }
    };

    match state.analysis.analyze(&user, upload.image, upload.grade).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!(LessonResponse::new(
                outcome.lesson,
                outcome.degraded,
                Some(outcome.usage)
            ))),
        ),
        Err(e) => {
            let (status, body) = map_analysis_error(&e);
            if status.is_server_error() {
                error!(error = %e, "Analysis failed");
            }
            (status, Json(body))
        }
    }
}

/// Analyze one homework photo without an account
///
/// Gated by a client-generated trial token; each token works exactly
/// once per server run. Nothing is persisted.
#[utoipa::path(
    post,
    path = "/analyze/preview",
    tag = "Analysis",
    params(
        ("X-Trial-Token" = String, Header, description = "One-shot trial token, at least 8 characters")
    ),
    request_body(
        content = Object,
        content_type = "multipart/form-data",
        description = "`file` = homework photo (image/*); `grade` = optional band: K-2, 3-5, 6-8 or 9-12"
    ),
    responses(
        (status = 200, description = "Lesson generated", body = LessonResponse),
        (status = 400, description = "Missing or invalid upload", body = Object),
        (status = 401, description = "Missing trial token", body = Object),
        (status = 402, description = "Trial already used", body = Object)
    )
)]
async fn analyze_preview(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> impl IntoResponse {
    let token = match headers.get(TRIAL_TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        Some(t) => t.to_string(),
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "Missing trial token"})),
            );
        }
    };

    let upload = match read_analyze_upload(multipart).await {
        Ok(upload) => upload,
        Err(msg) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": msg})),
            );
        }
    };

    if !state.trials.try_consume(&token).await {
        info!("Trial token rejected (spent or too short)");
        return (
            StatusCode::PAYMENT_REQUIRED,
            Json(serde_json::json!({
                "error": "Trial already used. Create a free account for daily scans."
            })),
        );
    }

    match state.analysis.analyze_preview(upload.image, upload.grade).await {
        Ok((lesson, degraded)) => (
            StatusCode::OK,
            Json(serde_json::json!(LessonResponse::new(lesson, degraded, None))),
        ),
        Err(e) => {
            let (status, body) = map_analysis_error(&e);
            if status.is_server_error() {
                error!(error = %e, "Preview analysis failed");
            }
            (status, Json(body))
        }
    }
}

/// Billing provider webhook
///
/// The signature is verified over the raw request bytes before the
/// body is parsed; re-serialized JSON would not verify.
#[utoipa::path(
    post,
    path = "/webhooks/billing",
    tag = "Billing",
    params(
        ("X-Billing-Signature" = String, Header, description = "Base64 HMAC-SHA256 of the raw request body")
    ),
    request_body(content = Object, description = "Raw provider event JSON"),
    responses(
        (status = 200, description = "Event acknowledged", body = Object),
        (status = 400, description = "Malformed payload", body = Object),
        (status = 401, description = "Invalid signature", body = Object),
        (status = 500, description = "Failed to apply billing event", body = Object)
    )
)]
async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature = headers
        .get(BILLING_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.billing.process(&body, signature).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "received": true,
                "outcome": outcome_label(&outcome)
            })),
        ),
        Err(e) => {
            let (status, body) = map_webhook_error(&e);
            if status.is_server_error() {
                error!(error = %e, "Failed to apply billing event");
            }
            (status, Json(body))
        }
    }
}
