use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::SET_COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use pants_api::{
    CreateInquestRequest, InquestView, PantsApi, Pick, RecordVoteRequest, RuleOutcome,
    API_CONTRACT_VERSION,
};
use pants_core::{FieldError, InquestId, PantsError, SeenSet, ValidationErrors};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

mod session;

use session::SessionCodec;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const MSG_NOT_A_STRING: &str = "must be a string";
const ABOUT_TEXT: &str = "Pants or Not shows you a picture and asks one question: pants, or not? \
Rule yes, no, or not sure and you will be shown another picture you have not ruled on yet.";

#[derive(Debug, Clone)]
struct ServiceState {
    api: PantsApi,
    sessions: SessionCodec,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    field_errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct AboutResponse {
    name: &'static str,
    description: &'static str,
    votes: [&'static str; 3],
}

#[derive(Debug, Parser)]
#[command(name = "pants-service")]
#[command(about = "HTTP service for Pants or Not")]
struct Args {
    #[arg(long, env = "PANTS_DB", default_value = "./pants_or_not.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "PANTS_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, env = "PANTS_SESSION_SECRET", hide_env_values = true)]
    session_secret: Option<String>,
    #[arg(long, env = "PANTS_LOG", default_value = "info")]
    log_filter: String,
    #[arg(long, default_value_t = false)]
    secure_cookie: bool,
}

/// Where the session signing key comes from.
#[derive(Debug, Clone)]
enum SessionKey {
    /// Operator-supplied secret; sessions survive restarts.
    Configured(String),
    /// Random key generated at startup; every restart logs all visitors out.
    Ephemeral,
}

#[derive(Debug, Clone)]
struct ServiceConfig {
    db: PathBuf,
    bind: SocketAddr,
    session_key: SessionKey,
    log_filter: String,
    secure_cookie: bool,
}

impl From<Args> for ServiceConfig {
    fn from(args: Args) -> Self {
        Self {
            db: args.db,
            bind: args.bind,
            session_key: args.session_secret.map_or(SessionKey::Ephemeral, SessionKey::Configured),
            log_filter: args.log_filter,
            secure_cookie: args.secure_cookie,
        }
    }
}

impl ServiceConfig {
    fn session_codec(&self) -> Result<SessionCodec> {
        match &self.session_key {
            SessionKey::Configured(secret) => {
                SessionCodec::new(secret.as_bytes(), self.secure_cookie)
            }
            SessionKey::Ephemeral => {
                warn!("no session secret configured; sessions will not survive a restart");
                Ok(SessionCodec::ephemeral(self.secure_cookie))
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            field_errors: Vec::new(),
        }
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "not found")
    }

    fn internal(err: &anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }

    fn invalid(errors: &ValidationErrors) -> Self {
        Self {
            field_errors: errors.as_slice().to_vec(),
            ..Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                PantsError::Validation(errors.clone()).to_string(),
            )
        }
    }

    fn from_api(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<PantsError>() {
            Some(PantsError::Validation(errors)) => Self::invalid(errors),
            Some(PantsError::NotFound { .. }) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            None => Self::internal(err),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run one store-bound API call on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ServiceError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(|err| ServiceError::from_api(&err)),
        Err(err) => Err(ServiceError::internal(&anyhow::Error::new(err))),
    }
}

fn json_body(body: Result<Json<Value>, JsonRejection>) -> Result<Value, ServiceError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ServiceError::new(rejection.status(), rejection.body_text())),
    }
}

/// String field of a request body; absent and `null` read as `None`, other types are field errors.
fn text_field(body: &Value, field: &str, errors: &mut ValidationErrors) -> Option<String> {
    match body.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text.clone()),
        Some(_) => {
            errors.add(field, MSG_NOT_A_STRING);
            None
        }
    }
}

fn parse_inquest_id(raw: &str) -> Result<InquestId, ServiceError> {
    raw.parse::<InquestId>().map_err(|_| ServiceError::not_found())
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(random_inquest))
        .route("/v1/health", get(health))
        .route("/v1/about", get(about))
        .route("/v1/inquests", post(create_inquest))
        .route("/v1/inquests/random", get(random_inquest))
        .route("/v1/inquests/latest", get(latest_inquest))
        .route("/v1/inquests/:id", get(show_inquest))
        .route("/v1/inquests/:id/rulings", post(create_ruling))
        .fallback(fallback)
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from(Args::parse());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_filter)?)
        .with_target(false)
        .init();

    let state =
        ServiceState { api: PantsApi::new(config.db.clone()), sessions: config.session_codec()? };
    let migrated = state.api.migrate(false)?;
    info!(
        schema_version = migrated.after_version,
        applied = ?migrated.would_apply_versions,
        "database ready"
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(bind = %config.bind, db = %config.db.display(), "pants-service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn about() -> Json<ServiceEnvelope<AboutResponse>> {
    Json(envelope(AboutResponse {
        name: "Pants or Not",
        description: ABOUT_TEXT,
        votes: ["yes", "no", "not_sure"],
    }))
}

async fn fallback() -> ServiceError {
    ServiceError::not_found()
}

#[instrument(skip_all)]
async fn random_inquest(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Pick>>, ServiceError> {
    let seen = state.sessions.read(&headers);
    let api = state.api.clone();
    let pick = blocking(move || api.random_inquest(&seen)).await?;
    Ok(Json(envelope(pick)))
}

#[instrument(skip_all)]
async fn latest_inquest(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Pick>>, ServiceError> {
    let api = state.api.clone();
    let pick = blocking(move || api.latest_inquest()).await?;
    Ok(Json(envelope(pick)))
}

#[instrument(skip_all)]
async fn create_inquest(
    State(state): State<ServiceState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<InquestView>>), ServiceError> {
    let body = json_body(body)?;
    let mut errors = ValidationErrors::new();
    let request = CreateInquestRequest { image_url: text_field(&body, "image_url", &mut errors) };
    if !errors.is_empty() {
        return Err(ServiceError::invalid(&errors));
    }

    let api = state.api.clone();
    let view = blocking(move || api.create_inquest(request)).await?;
    Ok((StatusCode::CREATED, Json(envelope(view))))
}

#[instrument(skip_all, fields(inquest_id = %path.0))]
async fn show_inquest(
    State(state): State<ServiceState>,
    path: Path<String>,
) -> Result<Json<ServiceEnvelope<InquestView>>, ServiceError> {
    let id = parse_inquest_id(&path.0)?;
    let api = state.api.clone();
    let view = blocking(move || api.show_inquest(id)).await?;
    Ok(Json(envelope(view)))
}

#[instrument(skip_all, fields(inquest_id = %path.0))]
async fn create_ruling(
    State(state): State<ServiceState>,
    path: Path<String>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ServiceError> {
    let id = parse_inquest_id(&path.0)?;
    let body = json_body(body)?;
    let mut errors = ValidationErrors::new();
    let request = RecordVoteRequest { vote: text_field(&body, "vote", &mut errors) };
    if !errors.is_empty() {
        return Err(ServiceError::invalid(&errors));
    }

    let mut seen = state.sessions.read(&headers);
    let api = state.api.clone();
    let (outcome, mut seen) = blocking(move || -> Result<(RuleOutcome, SeenSet)> {
        let outcome = api.rule(id, request, &mut seen)?;
        Ok((outcome, seen))
    })
    .await?;

    let (cookie, forgotten) = state
        .sessions
        .set_cookie(&mut seen, outcome.ruling.inquest_id)
        .map_err(|err| ServiceError::internal(&err))?;
    if forgotten > 0 {
        warn!(forgotten, kept = seen.len(), "session cookie full; forgot oldest rulings");
    }
    info!(vote = outcome.ruling.vote.as_str(), seen = seen.len(), "ruling recorded");
    Ok((StatusCode::CREATED, [(SET_COOKIE, cookie)], Json(envelope(outcome))).into_response())
}
