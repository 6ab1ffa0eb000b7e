use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{header, HeaderValue, Method},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::{panic_response, ApiError};
use crate::lot::LotQuery;
use crate::scrape::scrape_lot;
use crate::types::{ExtractionResult, HealthResponse, ScrapeRequest, ScrapeResponse};
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let expose_details = !state.config.production;

    let routes = Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/api/scrape", get(scrape_query_handler).post(scrape_json_handler))
        .route("/scrape", get(scrape_query_handler).post(scrape_json_handler))
        .with_state(state);
    with_layers(routes, expose_details)
}

/// Panic guard innermost, CORS outermost so every response, the panic
/// envelope included, carries the CORS headers.
fn with_layers(routes: Router, expose_details: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    routes
        .layer(CatchPanicLayer::custom(
            move |panic: Box<dyn Any + Send + 'static>| handle_panic(panic, expose_details),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn scrape_query_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ScrapeRequest>, QueryRejection>,
) -> Response {
    let lot_no = match query {
        Ok(Query(request)) => request.lot_no,
        Err(rejection) => {
            warn!("Rejected scrape query: {}", rejection.body_text());
            None
        }
    };
    respond(&state, lot_no).await
}

async fn scrape_json_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ScrapeRequest>, JsonRejection>,
) -> Response {
    let lot_no = match body {
        Ok(Json(request)) => request.lot_no,
        Err(rejection) => {
            warn!("Rejected scrape body: {}", rejection.body_text());
            None
        }
    };
    respond(&state, lot_no).await
}

async fn respond(state: &AppState, lot_no: Option<String>) -> Response {
    match run(state, lot_no).await {
        Ok(result) => success_response(result, state.config.cache_max_age_secs),
        Err(err) => err.into_response_with(!state.config.production),
    }
}

async fn run(state: &AppState, lot_no: Option<String>) -> Result<ExtractionResult, ApiError> {
    let lot = LotQuery::parse(lot_no.as_deref().unwrap_or_default(), &state.config.lot_policy)?;
    scrape_lot(state, &lot).await
}

fn success_response(result: ExtractionResult, max_age: u64) -> Response {
    let mut response = Json(ScrapeResponse::from(result)).into_response();
    let cache = format!("public, max-age={0}, s-maxage={0}", max_age);
    if let Ok(value) = HeaderValue::from_str(&cache) {
        response.headers_mut().insert(header::CACHE_CONTROL, value);
    }
    response
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>, expose_details: bool) -> Response {
    let details = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic payload".to_string()
    };
    error!("Request handler panicked: {}", details);
    panic_response(expose_details.then_some(details))
}
