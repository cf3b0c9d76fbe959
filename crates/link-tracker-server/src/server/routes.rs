//! Link tracker endpoints
//!
//! - `GET /g?url=` - redirect to a whitelisted URL and log the hit
//! - `PUT /url?url=` - add a URL to the whitelist
//! - `GET /stats?url=` - daily hits on a URL over the last 7 days
//! - `GET /healthcheck` - liveness

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use chrono::Duration;
use serde::Deserialize;
use tracing::{debug, error};

use super::AppState;
use crate::db::{DatabaseError, Hit};

/// Window covered by `/stats`.
const REPORT_WINDOW_DAYS: i64 = 7;

/// Redirects, served on the public listener.
pub fn redirect_routes() -> Router<Arc<AppState>> {
    Router::new().route("/g", get(redirect_handler))
}

/// Whitelist management and reporting.
pub fn admin_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/url", put(add_url_handler))
        .route("/stats", get(stats_handler))
}

/// Served on every listener.
pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/healthcheck", get(healthcheck_handler))
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

impl UrlQuery {
    /// The `url` parameter, treating an empty value as missing.
    fn url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.is_empty())
    }
}

/// Store failures surface as a bare 500.
struct StoreError(DatabaseError);

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "Store operation failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    }
}

impl From<DatabaseError> for StoreError {
    fn from(e: DatabaseError) -> Self {
        Self(e)
    }
}

/// GET /g?url=
///
/// Redirects to `url` if it is whitelisted, queueing the hit for the
/// background worker. The redirect must never be cached, or repeat visits
/// would go uncounted.
async fn redirect_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UrlQuery>,
    headers: HeaderMap,
) -> Result<Response, StoreError> {
    let Some(url) = query.url() else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    if !state.store.is_whitelisted(url).await? {
        debug!(url, "Refusing redirect to unknown URL");
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let Ok(location) = HeaderValue::from_str(url) else {
        error!(url, "Whitelisted URL is not a valid Location header");
        return Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response());
    };

    let referrer = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    state.hits.record(Hit {
        url: url.to_string(),
        at: state.clock.now(),
        referrer,
    });

    Ok((
        StatusCode::FOUND,
        [
            (header::LOCATION, location),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache, no-store, must-revalidate"),
            ),
            (header::PRAGMA, HeaderValue::from_static("no-cache")),
            (header::EXPIRES, HeaderValue::from_static("0")),
        ],
    )
        .into_response())
}

/// PUT /url?url=
///
/// Adds an absolute URL to the whitelist.
async fn add_url_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UrlQuery>,
) -> Result<(StatusCode, &'static str), StoreError> {
    let Some(url) = query.url() else {
        return Ok((StatusCode::BAD_REQUEST, "URL is required"));
    };

    match url::Url::parse(url) {
        Ok(_) => {}
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            return Ok((StatusCode::BAD_REQUEST, "URL is not absolute"));
        }
        Err(e) => {
            debug!(url, error = %e, "Rejecting malformed URL");
            return Ok((StatusCode::BAD_REQUEST, "URL is not valid"));
        }
    }

    state.store.add_url(url).await?;
    Ok((StatusCode::CREATED, "OK"))
}

/// GET /stats?url=
///
/// Hits on `url` per UTC day over the last 7 days, oldest first.
async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UrlQuery>,
) -> Result<Response, StoreError> {
    let Some(url) = query.url() else {
        return Ok((StatusCode::NOT_FOUND, "URL is required").into_response());
    };

    let to = state.clock.now();
    let from = to - Duration::days(REPORT_WINDOW_DAYS);
    let days = state.store.daily_hits(url, from, to).await?;

    Ok(Json(days).into_response())
}

/// GET /healthcheck
async fn healthcheck_handler() -> &'static str {
    "OK"
}
