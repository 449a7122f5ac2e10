//! HTTP API: router, shared state and request handlers.
//!
//! Every handler authenticates through the [`AuthUser`] extractor, checks a
//! [`Permission`] and, for farmer-owned resources, that the caller may access
//! the owning farmer. Errors are returned as [`SakhiError`] responses.
use crate::auth::{self, AuthUser, Permission, TokenPair};
use crate::entities;
use crate::errors::SakhiError;
use crate::ext::{self, PestQuery, WeatherProvider};
use crate::jobs::JobContext;
use crate::jwks::JwksManager;
use crate::kb::{self, IngestRequest};
use crate::llm::LlmProvider;
use crate::media::{self, UploadQuery, UploadResponse};
use crate::notify::{NotifyProvider, Outbound};
use crate::nlu;
use crate::otp;
use crate::rules::{self, Rule};
use crate::settings::Settings;
use crate::storage::{
    self, ActivityFilter, ActivityView, AdvisoryView, AuditEntry, AuditFilter, FarmerUpdate,
    FarmerView, FieldUpdate, NewActivity, NewFarm, NewFarmer, NewField, NewPestReport,
    NewPricePoint, NewReminder, NewWeatherObs, Page, ReminderUpdate,
};
use crate::types::{AuditAction, ConsentKind, NotificationStatus, UserRole};
use crate::ws::{self, ConnectionHub};
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, FromRequest, FromRequestParts, Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// JSON body extractor whose rejections render as [`SakhiError`] bodies
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(SakhiError))]
pub struct ApiJson<T>(pub T);

/// Query string extractor whose rejections render as [`SakhiError`] bodies
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(SakhiError))]
pub struct ApiQuery<T>(pub T);

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub jwks: JwksManager,
    pub llm: Arc<LlmProvider>,
    pub notify: Arc<NotifyProvider>,
    pub hub: Arc<ConnectionHub>,
    pub rules: Arc<Vec<Rule>>,
    pub weather: WeatherProvider,
}

impl AppState {
    pub fn job_context(&self) -> JobContext {
        JobContext {
            db: self.db.clone(),
            settings: self.settings.clone(),
            llm: self.llm.clone(),
            notify: self.notify.clone(),
            hub: self.hub.clone(),
            rules: self.rules.clone(),
            weather: self.weather,
        }
    }
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
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
    // JSON API plus media files; nothing here should load other resources
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );

    response
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(allowed)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
    )
}

/// Public API router
pub fn router(state: AppState) -> Router {
    let upload_limit = state.settings.max_upload_bytes() as usize + 64 * 1024;

    let router = Router::new()
        .route("/health", get(health))
        .route("/.well-known/jwks.json", get(jwks_handler))
        // Auth
        .route("/auth/otp/start", post(otp_start))
        .route("/auth/otp/verify", post(otp_verify))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
        // Farmers, farms, fields
        .route("/farmers", get(list_farmers).post(create_farmer))
        .route("/farmers/{id}", get(get_farmer).patch(update_farmer))
        .route("/farmers/{id}/farms", get(list_farms).post(create_farm))
        .route("/farms/{id}/fields", get(list_fields).post(create_field))
        .route("/fields/{id}", get(get_field).patch(update_field))
        // Activities
        .route("/activities/log", post(log_activity))
        .route("/activities", get(list_activities))
        .route("/activities/{id}", get(get_activity))
        // Advisories
        .route("/advisories/generate", post(generate_advisories))
        .route("/advisories", get(list_advisories))
        .route("/advisories/{id}/read", post(read_advisory))
        .route("/advisories/{id}/ack", post(ack_advisory))
        // Reminders and notifications
        .route("/reminders", get(list_reminders).post(create_reminder))
        .route(
            "/reminders/{id}",
            get(get_reminder)
                .patch(update_reminder)
                .delete(delete_reminder),
        )
        .route("/reminders/{id}/pause", post(pause_reminder))
        .route("/reminders/{id}/resume", post(resume_reminder))
        .route("/notifications", get(list_notifications))
        .route("/notifications/{id}/delivered", post(mark_delivered))
        // Knowledge base
        .route("/kb/ingest", post(kb_ingest))
        .route("/kb/search", get(kb_search))
        .route("/kb/docs", get(kb_docs))
        .route("/kb/docs/{id}", get(kb_doc).delete(kb_delete))
        // External data
        .route("/ext/weather", get(latest_weather).post(ingest_weather))
        .route("/ext/pests", get(list_pests).post(ingest_pest))
        .route("/ext/prices", get(latest_prices).post(ingest_price))
        // Media
        .route(
            "/uploads",
            post(upload_media).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/media/{id}", get(serve_media))
        // Privacy
        .route("/privacy/consents", get(list_consents).post(set_consent))
        .route("/privacy/export", get(export_data))
        .route("/privacy/erase", post(erase_data))
        // Admin
        .route("/admin/stats", get(admin_stats))
        .route("/admin/audit-logs", get(admin_audit_logs))
        .route("/admin/users/{id}/role", axum::routing::patch(admin_set_role))
        // Real-time
        .route("/ws", get(ws::ws_handler));

    let router = match cors_layer(&state.settings.server.cors_origins) {
        Some(cors) => router.layer(cors),
        None => router,
    };

    router
        .layer(middleware::from_fn(security_headers))
        // Spans carry the path only; query strings may hold credentials (ws ?token=)
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &Request<Body>| {
                tracing::info_span!("request", method = %req.method(), path = %req.uri().path())
            }),
        )
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    seaography_schema: async_graphql::dynamic::Schema,
    jobs_schema: crate::admin_graphql::JobsSchema,
) -> miette::Result<()> {
    media::ensure_dirs(&state.settings.media.root).await?;

    // NOTE: OTP endpoints should additionally be rate limited per IP at the
    // reverse proxy; the per-phone lockout only covers guessing one number.

    let public_addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    // Start admin GraphQL server on separate port
    let admin_port = state.settings.admin_port()?;
    let admin_addr: SocketAddr = format!("{}:{}", state.settings.server.host, admin_port)
        .parse()
        .map_err(|e| miette::miette!("bad admin addr: {e}"))?;

    let admin_router = crate::admin_graphql::router(seaography_schema, jobs_schema);

    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .into_diagnostic()?;
    tracing::info!(%admin_addr, "Admin GraphQL API listening");
    tracing::info!(
        "GraphQL Playground available at http://{}/admin/playground",
        admin_addr
    );

    tokio::spawn(async move {
        if let Err(e) = axum::serve(admin_listener, admin_router).await {
            tracing::error!(error = %e, "Admin server failed");
        }
    });

    let router = router(state);
    tracing::info!(%public_addr, "Public API listening");
    let listener = tokio::net::TcpListener::bind(public_addr)
        .await
        .into_diagnostic()?;
    axum::serve(listener, router).await.into_diagnostic()?;
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn paged<T: Serialize>(key: &str, items: Vec<T>, total: u64, page: Page) -> Value {
    json!({
        key: items,
        "total": total,
        "page": page.page,
        "size": page.size,
    })
}

/// The farmer, if it exists and the caller may access it
async fn accessible_farmer(
    state: &AppState,
    user: &AuthUser,
    farmer_id: &str,
) -> Result<entities::farmer::Model, SakhiError> {
    let farmer = storage::get_farmer(&state.db, farmer_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Farmer"))?;
    user.require_farmer_access(&farmer)?;
    Ok(farmer)
}

/// The named farmer, or the caller's own profile when none is named
async fn target_farmer(
    state: &AppState,
    user: &AuthUser,
    farmer_id: Option<&str>,
) -> Result<entities::farmer::Model, SakhiError> {
    match farmer_id {
        Some(id) => accessible_farmer(state, user, id).await,
        None => storage::get_farmer_by_user(&state.db, user.id())
            .await?
            .ok_or_else(|| SakhiError::not_found("Farmer profile")),
    }
}

async fn farmer_of_farm(
    state: &AppState,
    user: &AuthUser,
    farm_id: &str,
) -> Result<entities::farm::Model, SakhiError> {
    let farm = storage::get_farm(&state.db, farm_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Farm"))?;
    accessible_farmer(state, user, &farm.farmer_id).await?;
    Ok(farm)
}

async fn accessible_field(
    state: &AppState,
    user: &AuthUser,
    field_id: &str,
) -> Result<entities::field::Model, SakhiError> {
    let field = storage::get_field(&state.db, field_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Field"))?;
    farmer_of_farm(state, user, &field.farm_id).await?;
    Ok(field)
}

async fn accessible_reminder(
    state: &AppState,
    user: &AuthUser,
    reminder_id: &str,
) -> Result<entities::reminder::Model, SakhiError> {
    let reminder = storage::get_reminder(&state.db, reminder_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Reminder"))?;
    accessible_farmer(state, user, &reminder.farmer_id).await?;
    Ok(reminder)
}

async fn accessible_media(
    state: &AppState,
    user: &AuthUser,
    media_id: &str,
) -> Result<entities::media::Model, SakhiError> {
    let media = storage::get_media(&state.db, media_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Media"))?;
    if !auth::can_access_media(user, &media) {
        return Err(SakhiError::Forbidden("not allowed to access this media".into()));
    }
    Ok(media)
}

async fn accessible_advisory(
    state: &AppState,
    user: &AuthUser,
    advisory_id: &str,
) -> Result<entities::advisory::Model, SakhiError> {
    let advisory = storage::get_advisory(&state.db, advisory_id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Advisory"))?;
    accessible_farmer(state, user, &advisory.farmer_id).await?;
    Ok(advisory)
}

// ============================================================================
// Health and keys
// ============================================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    match storage::ping(&state.db).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "ok", "database": "ok", "version": version})),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "database": "error", "version": version})),
            )
        }
    }
}

async fn jwks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jwks.jwks_json())
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Deserialize)]
struct OtpStartRequest {
    phone: String,
}

async fn otp_start(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<OtpStartRequest>,
) -> Result<Json<otp::OtpStarted>, SakhiError> {
    let phone = auth::normalize_phone(&req.phone)?;
    let (started, code) =
        otp::start(&state.db, &state.settings.auth, &state.settings.server, &phone).await?;

    if !state.settings.server.dev_mode {
        let sms = Outbound {
            channel: "sms".into(),
            recipient: phone.clone(),
            title: None,
            message: format!("Your Krishi Sakhi login code is {code}"),
        };
        state.notify.send(&sms).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to send OTP");
            SakhiError::Upstream("could not send OTP".into())
        })?;
    }
    Ok(Json(started))
}

#[derive(Debug, Deserialize)]
struct OtpVerifyRequest {
    req_id: String,
    code: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    #[serde(flatten)]
    tokens: TokenPair,
    user: entities::user::Model,
    is_new_user: bool,
}

async fn otp_verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<OtpVerifyRequest>,
) -> Result<Json<LoginResponse>, SakhiError> {
    let ip = client_ip(&headers);
    let phone = match otp::verify(&state.db, &state.settings.auth, &req.req_id, &req.code).await {
        Ok(phone) => phone,
        Err(e) => {
            storage::audit(
                &state.db,
                AuditEntry::new(None, AuditAction::Login)
                    .ip(ip)
                    .failed(e.to_string())
                    .metadata(json!({"req_id": req.req_id})),
            )
            .await;
            return Err(e);
        }
    };

    let (user, is_new_user) = storage::get_or_create_user_by_phone(&state.db, &phone).await?;
    if !user.is_active {
        return Err(SakhiError::Forbidden("account is disabled".into()));
    }
    storage::touch_last_login(&state.db, &user.id).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(&user.id), AuditAction::Login)
            .target("user", &user.id)
            .ip(ip),
    )
    .await;

    let tokens = auth::issue_token_pair(&state.db, &state.jwks, &state.settings, &user, None).await?;
    tracing::info!(user_id = %user.id, is_new_user, "User logged in");
    Ok(Json(LoginResponse {
        tokens,
        user,
        is_new_user,
    }))
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

async fn refresh(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RefreshRequest>,
) -> Result<Json<TokenPair>, SakhiError> {
    let pair =
        auth::rotate_refresh(&state.db, &state.jwks, &state.settings, &req.refresh_token).await?;
    Ok(Json(pair))
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: AuthUser,
) -> Result<Json<Value>, SakhiError> {
    let revoked = storage::revoke_user_refresh_tokens(&state.db, user.id()).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::Logout).ip(client_ip(&headers)),
    )
    .await;
    Ok(Json(json!({"revoked": revoked})))
}

async fn me(State(state): State<AppState>, user: AuthUser) -> Result<Json<Value>, SakhiError> {
    let farmer = storage::get_farmer_by_user(&state.db, user.id())
        .await?
        .map(FarmerView::from);
    Ok(Json(json!({
        "user": user.user,
        "role": user.role,
        "farmer": farmer,
    })))
}

// ============================================================================
// Farmers, farms, fields
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateFarmerRequest {
    /// Staff may create a profile for another user
    user_id: Option<String>,
    #[serde(flatten)]
    farmer: NewFarmer,
}

async fn create_farmer(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<CreateFarmerRequest>,
) -> Result<(StatusCode, Json<FarmerView>), SakhiError> {
    user.require(Permission::ProfileWrite)?;
    let owner = match req.user_id.as_deref() {
        Some(id) if id != user.id() => {
            user.require(Permission::FarmersWriteAll)?;
            id.to_string()
        }
        _ => user.id().to_string(),
    };
    let farmer = storage::create_farmer(&state.db, &owner, req.farmer).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::Create).target("farmer", &farmer.id),
    )
    .await;
    Ok((StatusCode::CREATED, Json(farmer.into())))
}

#[derive(Debug, Deserialize)]
struct FarmerListQuery {
    district: Option<String>,
    page: Option<u64>,
    size: Option<u64>,
}

async fn list_farmers(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<FarmerListQuery>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::FarmersReadAll)?;
    let page = Page::new(q.page, q.size)?;
    let (items, total) = storage::list_farmers(&state.db, q.district.as_deref(), page).await?;
    let items: Vec<FarmerView> = items.into_iter().map(FarmerView::from).collect();
    Ok(Json(paged("farmers", items, total, page)))
}

async fn get_farmer(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<FarmerView>, SakhiError> {
    user.require(Permission::ProfileRead)?;
    let farmer = accessible_farmer(&state, &user, &id).await?;
    Ok(Json(farmer.into()))
}

async fn update_farmer(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<FarmerUpdate>,
) -> Result<Json<FarmerView>, SakhiError> {
    user.require(Permission::ProfileWrite)?;
    accessible_farmer(&state, &user, &id).await?;
    let farmer = storage::update_farmer(&state.db, &id, update).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::Update).target("farmer", &id),
    )
    .await;
    Ok(Json(farmer.into()))
}

async fn create_farm(
    State(state): State<AppState>,
    user: AuthUser,
    Path(farmer_id): Path<String>,
    ApiJson(req): ApiJson<NewFarm>,
) -> Result<(StatusCode, Json<entities::farm::Model>), SakhiError> {
    user.require(Permission::FarmWrite)?;
    accessible_farmer(&state, &user, &farmer_id).await?;
    let farm = storage::create_farm(&state.db, &farmer_id, req).await?;
    Ok((StatusCode::CREATED, Json(farm)))
}

async fn list_farms(
    State(state): State<AppState>,
    user: AuthUser,
    Path(farmer_id): Path<String>,
) -> Result<Json<Vec<entities::farm::Model>>, SakhiError> {
    user.require(Permission::FarmRead)?;
    accessible_farmer(&state, &user, &farmer_id).await?;
    Ok(Json(storage::list_farms(&state.db, &farmer_id).await?))
}

async fn create_field(
    State(state): State<AppState>,
    user: AuthUser,
    Path(farm_id): Path<String>,
    ApiJson(req): ApiJson<NewField>,
) -> Result<(StatusCode, Json<entities::field::Model>), SakhiError> {
    user.require(Permission::FarmWrite)?;
    farmer_of_farm(&state, &user, &farm_id).await?;
    let field = storage::create_field(&state.db, &farm_id, req).await?;
    Ok((StatusCode::CREATED, Json(field)))
}

async fn list_fields(
    State(state): State<AppState>,
    user: AuthUser,
    Path(farm_id): Path<String>,
) -> Result<Json<Vec<entities::field::Model>>, SakhiError> {
    user.require(Permission::FarmRead)?;
    farmer_of_farm(&state, &user, &farm_id).await?;
    Ok(Json(storage::list_fields_for_farm(&state.db, &farm_id).await?))
}

async fn get_field(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<entities::field::Model>, SakhiError> {
    user.require(Permission::FarmRead)?;
    Ok(Json(accessible_field(&state, &user, &id).await?))
}

async fn update_field(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<FieldUpdate>,
) -> Result<Json<entities::field::Model>, SakhiError> {
    user.require(Permission::FarmWrite)?;
    accessible_field(&state, &user, &id).await?;
    Ok(Json(storage::update_field(&state.db, &id, update).await?))
}

// ============================================================================
// Activities
// ============================================================================

#[derive(Debug, Deserialize)]
struct LogActivityRequest {
    farmer_id: String,
    field_id: Option<String>,
    text: Option<String>,
    audio_media_id: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Serialize)]
struct LogActivityResponse {
    #[serde(flatten)]
    activity: ActivityView,
    nlu: Option<nlu::NluResult>,
}

async fn log_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: AuthUser,
    ApiJson(req): ApiJson<LogActivityRequest>,
) -> Result<(StatusCode, Json<LogActivityResponse>), SakhiError> {
    user.require(Permission::ActivityWrite)?;
    let farmer = accessible_farmer(&state, &user, &req.farmer_id).await?;

    if let Some(field_id) = req.field_id.as_deref() {
        storage::get_field_of_farmer(&state.db, field_id, &farmer.id)
            .await?
            .ok_or_else(|| SakhiError::not_found("Field"))?;
    }

    let text = req
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    if text.is_none() && req.audio_media_id.is_none() {
        return Err(SakhiError::BadRequest("text or audio_media_id is required".into()));
    }
    if state.settings.privacy.consent_required
        && !storage::has_consent(&state.db, &farmer.user_id, ConsentKind::DataProcessing).await?
    {
        return Err(SakhiError::Forbidden(
            "data_processing consent is required to log activities".into(),
        ));
    }
    if let Some(media_id) = req.audio_media_id.as_deref() {
        let media = accessible_media(&state, &user, media_id).await?;
        if media.kind != media::MediaKind::Audio.as_str() {
            return Err(SakhiError::BadRequest("audio_media_id is not an audio file".into()));
        }
    }

    let language = match (req.language, text.as_deref()) {
        (Some(lang), _) => lang,
        (None, Some(t)) => nlu::detect_language(t).to_string(),
        (None, None) => farmer.language_pref.clone(),
    };
    let analysis = text.as_deref().map(|t| nlu::analyze(t, &language));
    let kind = match (&analysis, text.as_deref()) {
        (Some(result), Some(t)) => nlu::activity_kind(result, t),
        _ => crate::types::ActivityKind::Other,
    };

    let activity = storage::create_activity(
        &state.db,
        NewActivity {
            farmer_id: farmer.id.clone(),
            field_id: req.field_id,
            kind,
            text_processed: text.as_deref().map(nlu::normalize_text),
            text_raw: text,
            audio_media_id: req.audio_media_id,
            data: analysis.as_ref().map(nlu::activity_data),
            language,
            intent: analysis.as_ref().map(|a| a.intent.clone()),
            confidence_score: analysis.as_ref().map(|a| a.confidence_score()),
        },
    )
    .await?;

    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::Create)
            .target("activity", &activity.id)
            .ip(client_ip(&headers)),
    )
    .await;
    tracing::info!(activity_id = %activity.id, farmer_id = %farmer.id, kind = %kind, "Activity logged");

    Ok((
        StatusCode::CREATED,
        Json(LogActivityResponse {
            activity: activity.into(),
            nlu: analysis,
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ActivityListQuery {
    farmer_id: Option<String>,
    field_id: Option<String>,
    from: Option<i64>,
    to: Option<i64>,
    page: Option<u64>,
    size: Option<u64>,
}

async fn list_activities(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<ActivityListQuery>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::ActivityRead)?;
    let page = Page::new(q.page, q.size)?;
    match q.farmer_id.as_deref() {
        Some(id) => {
            accessible_farmer(&state, &user, id).await?;
        }
        None if user.can(Permission::FarmersReadAll) => {}
        None => return Err(SakhiError::BadRequest("farmer_id is required".into())),
    }
    let filter = ActivityFilter {
        farmer_id: q.farmer_id,
        field_id: q.field_id,
        from: q.from,
        to: q.to,
    };
    let (items, total) = storage::list_activities(&state.db, &filter, page).await?;
    let items: Vec<ActivityView> = items.into_iter().map(ActivityView::from).collect();
    Ok(Json(paged("activities", items, total, page)))
}

async fn get_activity(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ActivityView>, SakhiError> {
    user.require(Permission::ActivityRead)?;
    let activity = storage::get_activity(&state.db, &id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Activity"))?;
    accessible_farmer(&state, &user, &activity.farmer_id).await?;
    Ok(Json(activity.into()))
}

// ============================================================================
// Advisories
// ============================================================================

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    farmer_id: String,
    field_id: Option<String>,
}

async fn generate_advisories(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<GenerateRequest>,
) -> Result<Json<rules::GenerateResponse>, SakhiError> {
    user.require(Permission::AdvisoryRead)?;
    let farmer = accessible_farmer(&state, &user, &req.farmer_id).await?;
    let resp = rules::generate_for_farmer(
        &state.db,
        &state.llm,
        &state.hub,
        &state.rules,
        &farmer,
        req.field_id.as_deref(),
    )
    .await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct AdvisoryListQuery {
    farmer_id: Option<String>,
    #[serde(default)]
    unread_only: bool,
    page: Option<u64>,
    size: Option<u64>,
}

async fn list_advisories(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<AdvisoryListQuery>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::AdvisoryRead)?;
    let page = Page::new(q.page, q.size)?;
    let farmer = target_farmer(&state, &user, q.farmer_id.as_deref()).await?;
    let (items, total) =
        storage::list_advisories(&state.db, &farmer.id, q.unread_only, page).await?;
    let items: Vec<AdvisoryView> = items.into_iter().map(AdvisoryView::from).collect();
    Ok(Json(paged("advisories", items, total, page)))
}

async fn read_advisory(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<AdvisoryView>, SakhiError> {
    user.require(Permission::AdvisoryRead)?;
    accessible_advisory(&state, &user, &id).await?;
    Ok(Json(storage::mark_advisory_read(&state.db, &id).await?.into()))
}

async fn ack_advisory(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<AdvisoryView>, SakhiError> {
    user.require(Permission::AdvisoryRead)?;
    accessible_advisory(&state, &user, &id).await?;
    Ok(Json(storage::acknowledge_advisory(&state.db, &id).await?.into()))
}

// ============================================================================
// Reminders and notifications
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateReminderRequest {
    farmer_id: Option<String>,
    #[serde(flatten)]
    reminder: NewReminder,
}

async fn create_reminder(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<CreateReminderRequest>,
) -> Result<(StatusCode, Json<entities::reminder::Model>), SakhiError> {
    user.require(Permission::ReminderWrite)?;
    let farmer = target_farmer(&state, &user, req.farmer_id.as_deref()).await?;
    if let Some(field_id) = req.reminder.field_id.as_deref() {
        storage::get_field_of_farmer(&state.db, field_id, &farmer.id)
            .await?
            .ok_or_else(|| SakhiError::not_found("Field"))?;
    }
    let reminder = storage::create_reminder(&state.db, &farmer.id, req.reminder).await?;
    Ok((StatusCode::CREATED, Json(reminder)))
}

#[derive(Debug, Deserialize)]
struct ReminderListQuery {
    farmer_id: Option<String>,
    #[serde(default)]
    include_inactive: bool,
}

async fn list_reminders(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<ReminderListQuery>,
) -> Result<Json<Vec<entities::reminder::Model>>, SakhiError> {
    user.require(Permission::ReminderRead)?;
    let farmer = target_farmer(&state, &user, q.farmer_id.as_deref()).await?;
    Ok(Json(
        storage::list_reminders(&state.db, &farmer.id, q.include_inactive).await?,
    ))
}

async fn get_reminder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<entities::reminder::Model>, SakhiError> {
    user.require(Permission::ReminderRead)?;
    Ok(Json(accessible_reminder(&state, &user, &id).await?))
}

async fn update_reminder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<ReminderUpdate>,
) -> Result<Json<entities::reminder::Model>, SakhiError> {
    user.require(Permission::ReminderWrite)?;
    accessible_reminder(&state, &user, &id).await?;
    Ok(Json(storage::update_reminder(&state.db, &id, update).await?))
}

async fn set_paused(
    state: &AppState,
    user: &AuthUser,
    id: &str,
    paused: bool,
) -> Result<entities::reminder::Model, SakhiError> {
    user.require(Permission::ReminderWrite)?;
    accessible_reminder(state, user, id).await?;
    storage::update_reminder(
        &state.db,
        id,
        ReminderUpdate {
            is_paused: Some(paused),
            ..ReminderUpdate::default()
        },
    )
    .await
}

async fn pause_reminder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<entities::reminder::Model>, SakhiError> {
    Ok(Json(set_paused(&state, &user, &id, true).await?))
}

async fn resume_reminder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<entities::reminder::Model>, SakhiError> {
    Ok(Json(set_paused(&state, &user, &id, false).await?))
}

async fn delete_reminder(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::ReminderWrite)?;
    accessible_reminder(&state, &user, &id).await?;
    let cancelled = storage::delete_reminder(&state.db, &id).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::Delete).target("reminder", &id),
    )
    .await;
    Ok(Json(json!({"deleted": true, "cancelled_notifications": cancelled})))
}

#[derive(Debug, Deserialize)]
struct NotificationListQuery {
    farmer_id: Option<String>,
    status: Option<NotificationStatus>,
    page: Option<u64>,
    size: Option<u64>,
}

async fn list_notifications(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<NotificationListQuery>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::NotificationRead)?;
    let page = Page::new(q.page, q.size)?;
    let farmer = target_farmer(&state, &user, q.farmer_id.as_deref()).await?;
    let (items, total) =
        storage::list_notifications(&state.db, &farmer.id, q.status, page).await?;
    Ok(Json(paged("notifications", items, total, page)))
}

/// Client acknowledgement that a sent notification reached the device
async fn mark_delivered(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<entities::notification::Model>, SakhiError> {
    user.require(Permission::NotificationRead)?;
    let notification = storage::get_notification(&state.db, &id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Notification"))?;
    accessible_farmer(&state, &user, &notification.farmer_id).await?;
    let updated =
        storage::transition_notification(&state.db, &id, NotificationStatus::Delivered, None)
            .await?;
    Ok(Json(updated))
}

// ============================================================================
// Knowledge base
// ============================================================================

async fn kb_ingest(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<IngestRequest>,
) -> Result<(StatusCode, Json<kb::IngestResponse>), SakhiError> {
    user.require(Permission::KbWrite)?;
    let resp = kb::ingest(&state.db, &state.settings.kb, req).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::Create).target("kb_doc", &resp.doc_id),
    )
    .await;
    Ok((StatusCode::CREATED, Json(resp)))
}

#[derive(Debug, Deserialize)]
struct KbSearchQuery {
    q: String,
    k: Option<usize>,
    lang: Option<String>,
}

async fn kb_search(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<KbSearchQuery>,
) -> Result<Json<kb::SearchResponse>, SakhiError> {
    user.require(Permission::KbRead)?;
    let resp = kb::search(&state.db, &state.settings.kb, &q.q, q.k, q.lang.as_deref()).await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct KbDocsQuery {
    lang: Option<String>,
}

async fn kb_docs(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<KbDocsQuery>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::KbRead)?;
    let docs = storage::list_kb_docs(&state.db, q.lang.as_deref()).await?;
    // Listing omits full content
    let docs: Vec<Value> = docs
        .into_iter()
        .map(|d| {
            json!({
                "id": d.id,
                "title": d.title,
                "source": d.source,
                "language": d.language,
                "url": d.url,
                "word_count": d.word_count,
                "created_at": d.created_at,
            })
        })
        .collect();
    Ok(Json(json!({"documents": docs})))
}

async fn kb_doc(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::KbRead)?;
    let doc = storage::get_kb_doc(&state.db, &id)
        .await?
        .ok_or_else(|| SakhiError::not_found("Document"))?;
    let chunks: Vec<Value> = storage::kb_doc_chunks(&state.db, &id)
        .await?
        .into_iter()
        .map(|c| {
            json!({
                "id": c.id,
                "ord": c.ord,
                "text": c.text,
                "start_char": c.start_char,
                "end_char": c.end_char,
            })
        })
        .collect();
    Ok(Json(json!({"document": doc, "chunks": chunks})))
}

async fn kb_delete(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<StatusCode, SakhiError> {
    user.require(Permission::KbWrite)?;
    storage::delete_kb_doc(&state.db, &id).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::Delete).target("kb_doc", &id),
    )
    .await;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// External data
// ============================================================================

async fn ingest_weather(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<NewWeatherObs>,
) -> Result<(StatusCode, Json<entities::weather_obs::Model>), SakhiError> {
    user.require(Permission::ExtWrite)?;
    Ok((
        StatusCode::CREATED,
        Json(storage::insert_weather_obs(&state.db, req).await?),
    ))
}

#[derive(Debug, Deserialize)]
struct DistrictQuery {
    district: String,
}

async fn latest_weather(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<DistrictQuery>,
) -> Result<Json<entities::weather_obs::Model>, SakhiError> {
    user.require(Permission::ExtRead)?;
    let obs = storage::latest_weather(&state.db, &q.district)
        .await?
        .ok_or_else(|| SakhiError::not_found("Weather observation"))?;
    Ok(Json(obs))
}

async fn ingest_pest(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<NewPestReport>,
) -> Result<(StatusCode, Json<entities::pest_report::Model>), SakhiError> {
    user.require(Permission::ExtWrite)?;
    Ok((
        StatusCode::CREATED,
        Json(storage::insert_pest_report(&state.db, req).await?),
    ))
}

async fn list_pests(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<PestQuery>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::ExtRead)?;
    let reports = ext::query_pests(&state.db, &q).await?;
    Ok(Json(json!({"reports": reports})))
}

async fn ingest_price(
    State(state): State<AppState>,
    user: AuthUser,
    ApiJson(req): ApiJson<NewPricePoint>,
) -> Result<(StatusCode, Json<entities::price_point::Model>), SakhiError> {
    user.require(Permission::ExtWrite)?;
    Ok((
        StatusCode::CREATED,
        Json(storage::insert_price_point(&state.db, req).await?),
    ))
}

#[derive(Debug, Deserialize)]
struct PriceQuery {
    commodity: String,
    limit: Option<u64>,
}

async fn latest_prices(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<PriceQuery>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::ExtRead)?;
    let limit = q.limit.unwrap_or(10).clamp(1, 100);
    let prices = storage::latest_prices(&state.db, &q.commodity, limit).await?;
    Ok(Json(json!({"commodity": q.commodity, "prices": prices})))
}

// ============================================================================
// Media
// ============================================================================

async fn upload_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: AuthUser,
    ApiQuery(q): ApiQuery<UploadQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadResponse>), SakhiError> {
    user.require(Permission::MediaUpload)?;
    let media = media::save_upload(&state.db, &state.settings, user.id(), &q.filename, &body).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::FileUpload)
            .target("media", &media.id)
            .ip(client_ip(&headers)),
    )
    .await;
    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            url: format!("{}/media/{}", state.settings.base_url(), media.id),
            id: media.id,
            kind: media.kind,
            mime: media.mime,
            size_bytes: media.size_bytes,
        }),
    ))
}

/// Return an upload's bytes to its owner (or staff)
async fn serve_media(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SakhiError> {
    let media = accessible_media(&state, &user, &id).await?;
    let bytes = media::read(&state.settings.media.root, &media).await?;
    Ok((
        [
            (header::CONTENT_TYPE, media.mime),
            (header::CACHE_CONTROL, "private, no-store".to_string()),
        ],
        bytes,
    ))
}

// ============================================================================
// Privacy
// ============================================================================

async fn list_consents(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::PrivacySelf)?;
    let current = storage::current_consents(&state.db, user.id()).await?;
    let history = storage::consent_history(&state.db, user.id()).await?;
    Ok(Json(json!({
        "version": storage::CONSENT_VERSION,
        "current": current,
        "history": history,
    })))
}

#[derive(Debug, Deserialize)]
struct ConsentRequest {
    kind: ConsentKind,
    granted: bool,
    purpose: Option<String>,
}

async fn set_consent(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: AuthUser,
    ApiJson(req): ApiJson<ConsentRequest>,
) -> Result<(StatusCode, Json<entities::consent::Model>), SakhiError> {
    user.require(Permission::PrivacySelf)?;
    let consent =
        storage::record_consent(&state.db, user.id(), req.kind, req.granted, req.purpose).await?;
    let action = if req.granted {
        AuditAction::ConsentGrant
    } else {
        AuditAction::ConsentRevoke
    };
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), action)
            .target("consent", &consent.id)
            .ip(client_ip(&headers))
            .metadata(json!({"kind": req.kind})),
    )
    .await;
    Ok((StatusCode::CREATED, Json(consent)))
}

async fn export_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: AuthUser,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::PrivacySelf)?;
    let export = storage::export_user_data(&state.db, user.id()).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::ExportData)
            .target("user", user.id())
            .ip(client_ip(&headers)),
    )
    .await;
    Ok(Json(export))
}

#[derive(Debug, Deserialize)]
struct EraseRequest {
    #[serde(default)]
    confirm: bool,
}

async fn erase_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    user: AuthUser,
    ApiJson(req): ApiJson<EraseRequest>,
) -> Result<Json<storage::ErasureSummary>, SakhiError> {
    user.require(Permission::PrivacySelf)?;
    if !req.confirm {
        return Err(SakhiError::BadRequest(
            "erasure must be confirmed with {\"confirm\": true}".into(),
        ));
    }
    let summary = storage::erase_user_data(&state.db, user.id()).await?;
    let files = media::remove_files(&state.settings.media.root, &summary.media_paths).await;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::DeleteData)
            .target("user", user.id())
            .ip(client_ip(&headers))
            .metadata(json!({"summary": summary, "files_removed": files})),
    )
    .await;
    tracing::info!(user_id = %user.id(), "User data erased");
    Ok(Json(summary))
}

// ============================================================================
// Admin
// ============================================================================

async fn admin_stats(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::SystemStats)?;
    let stats = storage::system_stats(&state.db).await?;
    Ok(Json(json!({
        "stats": stats,
        "live_connections": state.hub.connection_count(),
        "connected_farmers": state.hub.connected_farmers(),
    })))
}

#[derive(Debug, Deserialize)]
struct AuditLogQuery {
    user_id: Option<String>,
    action: Option<AuditAction>,
    from: Option<i64>,
    to: Option<i64>,
    page: Option<u64>,
    size: Option<u64>,
}

async fn admin_audit_logs(
    State(state): State<AppState>,
    user: AuthUser,
    ApiQuery(q): ApiQuery<AuditLogQuery>,
) -> Result<Json<Value>, SakhiError> {
    user.require(Permission::AuditRead)?;
    let page = Page::new(q.page, q.size)?;
    let filter = AuditFilter {
        user_id: q.user_id,
        action: q.action,
        from: q.from,
        to: q.to,
    };
    let (items, total) = storage::list_audit_logs(&state.db, &filter, page).await?;
    Ok(Json(paged("audit_logs", items, total, page)))
}

#[derive(Debug, Deserialize)]
struct RoleRequest {
    role: UserRole,
}

async fn admin_set_role(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<RoleRequest>,
) -> Result<Json<entities::user::Model>, SakhiError> {
    user.require(Permission::UsersManage)?;
    let updated = storage::set_user_role(&state.db, &id, req.role).await?;
    storage::audit(
        &state.db,
        AuditEntry::new(Some(user.id()), AuditAction::Update)
            .target("user", &id)
            .metadata(json!({"role": req.role})),
    )
    .await;
    Ok(Json(updated))
}
