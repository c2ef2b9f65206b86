use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use crate::location::types::LocationError;
use crate::location::{
    format_coords, Fix, LocationSource, ManualEntry, PincodeDetails, ResolvedLocation, SearchCandidate,
};

use super::state::AppState;

// ─── Error response ──────────────────────────────────────────────

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
    code: u16,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    manual_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    manual_reason: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.message,
            code: self.status.as_u16(),
            manual_required: self.manual_reason.is_some(),
            reason: self.manual_reason,
        };
        (self.status, Json(body)).into_response()
    }
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    ApiError {
        status,
        message: msg.into(),
        manual_reason: None,
    }
}

impl From<LocationError> for ApiError {
    fn from(e: LocationError) -> Self {
        let status = match &e {
            LocationError::Validation(_) => StatusCode::BAD_REQUEST,
            LocationError::ManualEntryRequired { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LocationError::PermissionDenied => StatusCode::FORBIDDEN,
            LocationError::NoResultFound { .. } => StatusCode::NOT_FOUND,
            LocationError::InvalidTransition { .. } => StatusCode::CONFLICT,
            LocationError::CapabilityUnavailable | LocationError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_provider_error() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let manual_reason = match &e {
            LocationError::ManualEntryRequired { reason } => Some(reason.clone()),
            _ => None,
        };
        ApiError {
            status,
            message: e.to_string(),
            manual_reason,
        }
    }
}

// ─── Location response ──────────────────────────────────────────

#[derive(Serialize)]
pub struct LocationResponse {
    #[serde(flatten)]
    pub location: ResolvedLocation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_coords: Option<String>,
    pub coordinates_measured: bool,
    pub captured_at_local: String,
}

impl LocationResponse {
    fn new(location: ResolvedLocation, state: &AppState) -> Self {
        let formatted_coords = location.coordinates().map(|c| format_coords(c.latitude, c.longitude));
        let captured_at_local = location
            .timestamp()
            .with_timezone(&state.timezone)
            .format("%Y-%m-%d %H:%M:%S %Z")
            .to_string();
        Self {
            coordinates_measured: location.coordinates_are_measured(),
            formatted_coords,
            captured_at_local,
            location,
        }
    }
}

/// Address of the requesting client: the first hop of `X-Forwarded-For`
/// when present, otherwise the TCP peer.
pub struct ClientAddr(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = || {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        };
        Ok(Self(forwarded_for(&parts.headers).or_else(peer)))
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn log_request(route: &str, start: Instant, outcome: &Result<ResolvedLocation, LocationError>) {
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(loc) => tracing::info!(route, city = loc.city(), source = %loc.source(), ms, "resolved"),
        Err(e) => tracing::info!(route, error = %e, ms, "not resolved"),
    }
}

// ─── GET /api/locate ─────────────────────────────────────────────

pub async fn locate(
    State(state): State<Arc<AppState>>,
    ClientAddr(client): ClientAddr,
) -> Result<Json<LocationResponse>, ApiError> {
    let start = Instant::now();
    let mut resolver = state.resolver_for(client);
    let outcome = resolver.resolve().await;
    log_request("/api/locate", start, &outcome);
    Ok(Json(LocationResponse::new(outcome?, &state)))
}

// ─── GET /api/reverse ────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ReverseQuery {
    pub lat: f64,
    pub lon: f64,
    pub accuracy: Option<f64>,
}

pub async fn reverse(
    State(state): State<Arc<AppState>>,
    ClientAddr(client): ClientAddr,
    Query(params): Query<ReverseQuery>,
) -> Result<Json<LocationResponse>, ApiError> {
    if !(-90.0..=90.0).contains(&params.lat) || !(-180.0..=180.0).contains(&params.lon) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Invalid coordinates. Lat: -90..90, Lon: -180..180",
        ));
    }
    let accuracy = params.accuracy.unwrap_or(f64::INFINITY);
    if accuracy.is_nan() || accuracy < 0.0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "Accuracy must be a non-negative radius in meters"));
    }

    let start = Instant::now();
    let fix = Fix {
        latitude: params.lat,
        longitude: params.lon,
        accuracy,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    };
    let mut resolver = state.resolver_for(client);
    let outcome = resolver.resolve_fix(fix, LocationSource::BrowserGps).await;
    log_request("/api/reverse", start, &outcome);
    Ok(Json(LocationResponse::new(outcome?, &state)))
}

// ─── GET /api/search ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Vec<SearchCandidate>>, ApiError> {
    let resolver = state.resolver_for(None);
    let candidates = resolver.search(&params.q).await?;
    tracing::info!(query = %params.q, results = candidates.len(), "search");
    Ok(Json(candidates))
}

// ─── POST /api/select ────────────────────────────────────────────

pub async fn select(
    State(state): State<Arc<AppState>>,
    Json(candidate): Json<SearchCandidate>,
) -> Result<Json<LocationResponse>, ApiError> {
    let mut resolver = state.resolver_for(None);
    let location = resolver.select_candidate(&candidate)?;
    Ok(Json(LocationResponse::new(location, &state)))
}

// ─── POST /api/manual ────────────────────────────────────────────

pub async fn manual(
    State(state): State<Arc<AppState>>,
    Json(entry): Json<ManualEntry>,
) -> Result<Json<LocationResponse>, ApiError> {
    let mut resolver = state.resolver_for(None);
    let location = resolver.submit_manual(&entry)?;
    Ok(Json(LocationResponse::new(location, &state)))
}

// ─── GET /api/pincode/{pin} ──────────────────────────────────────

pub async fn pincode(
    State(state): State<Arc<AppState>>,
    Path(pin): Path<String>,
) -> Result<Json<PincodeDetails>, ApiError> {
    let resolver = state.resolver_for(None);
    Ok(Json(resolver.lookup_pincode(&pin).await?))
}
