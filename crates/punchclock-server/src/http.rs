//! HTTP API.
//!
//! Authentication happens upstream; the gateway forwards the authenticated
//! subject in the `x-subject-id` header.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use punchclock_core::{Error, ErrorCode, Violation};

use crate::service::ScanRequest;
use crate::state::AppState;

pub const SUBJECT_HEADER: &str = "x-subject-id";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/attendance/scan", post(scan))
        .route("/terminals", post(create_terminal))
        .route("/terminals/{public_id}/token", get(terminal_token))
        .route("/terminals/{public_id}/disable", post(disable_terminal))
        .route("/subjects/{subject_id}/chain", get(chain))
        .route("/subjects/{subject_id}/summary/daily", get(daily_summary))
        .route("/subjects/{subject_id}/summary/week", get(week_summary))
        .route("/subjects/{subject_id}/summary/month", get(month_summary))
        .route("/subjects/{subject_id}/summary/contract", get(contract_summary))
        .with_state(state)
}

/// HTTP status for an error code.
pub const fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::MalformedToken | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorCode::InvalidSignature => StatusCode::UNAUTHORIZED,
        ErrorCode::TokenExpired | ErrorCode::TokenAlreadyUsedOrExpired => StatusCode::GONE,
        ErrorCode::TerminalNotFound => StatusCode::NOT_FOUND,
        ErrorCode::TerminalInactive => StatusCode::FORBIDDEN,
        ErrorCode::SequenceViolation
        | ErrorCode::OutOfHours
        | ErrorCode::DuplicateRecord
        | ErrorCode::DailyLimitExceeded => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::ChainIntegrityViolation => StatusCode::CONFLICT,
        ErrorCode::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<Violation>,
    retryable: bool,
}

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    Core(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Core(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: "UNAUTHENTICATED".into(),
                    message: format!("missing {SUBJECT_HEADER} header"),
                    errors: Vec::new(),
                    retryable: false,
                },
            ),
            Self::Core(e) => {
                let code = e.code();
                let status = status_for(code);
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                }
                (
                    status,
                    ErrorBody {
                        code: code.as_str().to_string(),
                        // Internal details stay in the log.
                        message: if code == ErrorCode::Internal {
                            "internal error".to_string()
                        } else {
                            e.to_string()
                        },
                        errors: e.violations().to_vec(),
                        retryable: e.is_retryable(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Authenticated subject taken from the gateway header.
#[derive(Debug, Clone)]
pub struct SubjectId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for SubjectId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(SUBJECT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Self(s.to_string()))
            .ok_or(ApiError::Unauthenticated)
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| Error::InvalidRequest(e.body_text()).into())
}

/// `GET /health`
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `POST /attendance/scan`
async fn scan(
    State(state): State<AppState>,
    SubjectId(subject): SubjectId,
    body: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = json_body(body)?;
    let outcome = state.attendance.register_scan(&subject, request).await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
struct CreateTerminal {
    name: String,
    #[serde(default)]
    location: Option<String>,
}

/// `POST /terminals`
async fn create_terminal(
    State(state): State<AppState>,
    SubjectId(admin): SubjectId,
    body: Result<Json<CreateTerminal>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = json_body(body)?;
    if request.name.trim().is_empty() {
        return Err(Error::InvalidRequest("terminal name is required".into()).into());
    }
    let terminal = state
        .db
        .create_terminal(
            &uuid::Uuid::new_v4().to_string(),
            &uuid::Uuid::new_v4().to_string(),
            request.name.trim(),
            request.location.as_deref(),
            state.clock.now(),
        )
        .await
        .map_err(Error::from)?;
    info!(terminal = %terminal.public_id, by = %admin, "Terminal registered");
    Ok((StatusCode::CREATED, Json(terminal)).into_response())
}

/// `GET /terminals/{public_id}/token`
async fn terminal_token(
    State(state): State<AppState>,
    Path(public_id): Path<String>,
) -> Result<Response, ApiError> {
    let issued = state.issuer.current(&public_id).await?;
    Ok(Json(issued).into_response())
}

/// `POST /terminals/{public_id}/disable`
async fn disable_terminal(
    State(state): State<AppState>,
    SubjectId(admin): SubjectId,
    Path(public_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let found = state
        .db
        .set_terminal_active(&public_id, false, state.clock.now())
        .await
        .map_err(Error::from)?;
    if !found {
        return Err(Error::TerminalNotFound(public_id).into());
    }
    info!(terminal = %public_id, by = %admin, "Terminal disabled");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /subjects/{subject_id}/chain`
///
/// 200 with the report when the chain verifies, 409 with the same report
/// when it does not.
async fn chain(
    State(state): State<AppState>,
    _caller: SubjectId,
    Path(subject_id): Path<String>,
) -> Result<Response, ApiError> {
    let report = state.attendance.ledger().verify_chain(&subject_id).await?;
    let status = if report.valid {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(report)).into_response())
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct MonthQuery {
    year: i32,
    month: u32,
}

fn today(state: &AppState) -> NaiveDate {
    punchclock_core::LocalCalendar::from_offset_minutes(state.config.server.utc_offset_minutes)
        .date_of(state.clock.now())
}

/// `GET /subjects/{subject_id}/summary/daily?date=`
async fn daily_summary(
    State(state): State<AppState>,
    _caller: SubjectId,
    Path(subject_id): Path<String>,
    Query(query): Query<DateQuery>,
) -> Result<Response, ApiError> {
    let date = query.date.unwrap_or_else(|| today(&state));
    let summary = state.summaries.daily(&subject_id, date).await?;
    Ok(Json(summary).into_response())
}

/// `GET /subjects/{subject_id}/summary/week?date=`
async fn week_summary(
    State(state): State<AppState>,
    _caller: SubjectId,
    Path(subject_id): Path<String>,
    Query(query): Query<DateQuery>,
) -> Result<Response, ApiError> {
    let date = query.date.unwrap_or_else(|| today(&state));
    let summary = state.summaries.week(&subject_id, date).await?;
    Ok(Json(summary).into_response())
}

/// `GET /subjects/{subject_id}/summary/month?year=&month=`
async fn month_summary(
    State(state): State<AppState>,
    _caller: SubjectId,
    Path(subject_id): Path<String>,
    Query(query): Query<MonthQuery>,
) -> Result<Response, ApiError> {
    let summary = state
        .summaries
        .month(&subject_id, query.year, query.month)
        .await?;
    Ok(Json(summary).into_response())
}

/// `GET /subjects/{subject_id}/summary/contract`
async fn contract_summary(
    State(state): State<AppState>,
    _caller: SubjectId,
    Path(subject_id): Path<String>,
) -> Result<Response, ApiError> {
    let progress = state.summaries.contract(&subject_id).await?;
    Ok(Json(progress).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_violations_are_unprocessable() {
        for code in [
            ErrorCode::SequenceViolation,
            ErrorCode::OutOfHours,
            ErrorCode::DuplicateRecord,
            ErrorCode::DailyLimitExceeded,
        ] {
            assert_eq!(status_for(code), StatusCode::UNPROCESSABLE_ENTITY);
        }
    }

    #[test]
    fn token_failures_map_to_distinct_statuses() {
        assert_eq!(status_for(ErrorCode::MalformedToken), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorCode::InvalidSignature), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorCode::TokenExpired), StatusCode::GONE);
        assert_eq!(status_for(ErrorCode::TokenAlreadyUsedOrExpired), StatusCode::GONE);
        assert_eq!(status_for(ErrorCode::TerminalInactive), StatusCode::FORBIDDEN);
    }

    #[test]
    fn storage_errors_are_retryable_503() {
        let err = ApiError::from(Error::Storage(punchclock_core::db::DatabaseError::Connection(
            "down".into(),
        )));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
