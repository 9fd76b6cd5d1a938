//! Query and Stream API
//!
//! The read-only HTTP surface over the live cache, plus the WebSocket
//! endpoint where batch subscribers attach.
//!
//! # Endpoints
//!
//! - `GET /bonds` - filtered/sorted/paginated structured view
//! - `GET /bonds/summary` - aggregate price/yield statistics
//! - `GET /status` - newline-delimited dump of every serialized state
//! - `GET /ws` - WebSocket upgrade; the connection becomes a subscriber
//!
//! All queries are pure read-only transformations over a cache snapshot.
//! Pipeline internals never surface as 5xx here: a request fails only
//! when its own parameters are invalid.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::bond::EnrichedBond;
use crate::domain::cache::StatusCache;
use crate::infrastructure::broadcast::SubscriberRegistry;

// =============================================================================
// Query Types
// =============================================================================

/// Raw `/bonds` query string, straight from the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BondQuery {
    /// 1-based page number.
    pub page: Option<usize>,
    /// Page size.
    pub size: Option<usize>,
    /// Case-insensitive substring match on the bond id.
    pub search: Option<String>,
    /// Sort field: id, price, yield, or coupon.
    pub sort_by: Option<String>,
    /// Sort direction: asc or desc.
    pub sort_dir: Option<String>,
    /// Minimum price, inclusive.
    pub min_price: Option<i64>,
    /// Maximum price, inclusive.
    pub max_price: Option<i64>,
    /// Minimum current yield, inclusive.
    pub min_yield: Option<f64>,
    /// Maximum current yield, inclusive.
    pub max_yield: Option<f64>,
}

/// Field to sort by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortField {
    Id,
    Price,
    Yield,
    Coupon,
}

impl SortField {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "id" => Some(Self::Id),
            "price" => Some(Self::Price),
            "yield" => Some(Self::Yield),
            "coupon" => Some(Self::Coupon),
            _ => None,
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SortDir {
    #[default]
    Asc,
    Desc,
}

impl SortDir {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }
}

/// Validated query parameters.
#[derive(Debug, Clone)]
struct QueryParams {
    page: usize,
    size: usize,
    search: Option<String>,
    sort: Option<(SortField, SortDir)>,
    min_price: Option<i64>,
    max_price: Option<i64>,
    min_yield: Option<f64>,
    max_yield: Option<f64>,
}

impl TryFrom<BondQuery> for QueryParams {
    type Error = ApiError;

    fn try_from(query: BondQuery) -> Result<Self, Self::Error> {
        let page = query.page.unwrap_or(1);
        if page == 0 {
            return Err(ApiError::InvalidParam("page must be >= 1".to_string()));
        }

        let size = query.size.unwrap_or(100);
        if size == 0 {
            return Err(ApiError::InvalidParam("size must be >= 1".to_string()));
        }

        let sort = match query.sort_by {
            None => None,
            Some(field) => {
                let field = SortField::parse(&field).ok_or_else(|| {
                    ApiError::InvalidParam(format!(
                        "sortBy must be one of id, price, yield, coupon; got {field:?}"
                    ))
                })?;
                let dir = match query.sort_dir {
                    None => SortDir::default(),
                    Some(dir) => SortDir::parse(&dir).ok_or_else(|| {
                        ApiError::InvalidParam(format!(
                            "sortDir must be asc or desc; got {dir:?}"
                        ))
                    })?,
                };
                Some((field, dir))
            }
        };

        Ok(Self {
            page,
            size,
            search: query.search.filter(|s| !s.is_empty()),
            sort,
            min_price: query.min_price,
            max_price: query.max_price,
            min_yield: query.min_yield,
            max_yield: query.max_yield,
        })
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// One page of the bond table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BondPageResponse {
    /// Bonds on this page.
    pub data: Vec<EnrichedBond>,
    /// 1-based page number.
    pub page: usize,
    /// Page size requested.
    pub size: usize,
    /// Bonds matching the filters across all pages.
    pub total_count: usize,
    /// Pages needed for the full result.
    pub total_pages: usize,
    /// Whether a next page exists.
    pub has_next: bool,
    /// Whether a previous page exists.
    pub has_previous: bool,
}

/// Aggregate statistics over the whole cache.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BondSummary {
    /// Distinct bonds cached.
    pub total_bonds: usize,
    /// Mean price.
    pub average_price: f64,
    /// Mean current yield.
    pub average_yield: f64,
    /// Lowest price.
    pub min_price: i64,
    /// Highest price.
    pub max_price: i64,
    /// Lowest current yield.
    pub min_yield: f64,
    /// Highest current yield.
    pub max_yield: f64,
}

// =============================================================================
// Errors
// =============================================================================

/// Query API errors. Only invalid request parameters produce errors;
/// the cache itself is always servable.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A query parameter failed validation.
    #[error("{0}")]
    InvalidParam(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let Self::InvalidParam(message) = self;
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody { error: message }),
        )
            .into_response()
    }
}

/// API server errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// API Server
// =============================================================================

/// Shared state for the query/stream API.
pub struct ApiState {
    cache: Arc<StatusCache>,
    registry: Arc<SubscriberRegistry>,
}

impl ApiState {
    /// Create new API state.
    #[must_use]
    pub const fn new(cache: Arc<StatusCache>, registry: Arc<SubscriberRegistry>) -> Self {
        Self { cache, registry }
    }
}

/// Query and stream HTTP server.
pub struct ApiServer {
    port: u16,
    state: Arc<ApiState>,
    cancel: CancellationToken,
}

impl ApiServer {
    /// Create a new API server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<ApiState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the API server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `ApiServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), ApiServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ApiServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| ApiServerError::ServerFailed(e.to_string()))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

/// Build the API router (exposed for in-process testing).
#[must_use]
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/bonds", get(list_bonds_handler))
        .route("/bonds/summary", get(summary_handler))
        .route("/status", get(status_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn list_bonds_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<BondQuery>,
) -> Result<Json<BondPageResponse>, ApiError> {
    let params = QueryParams::try_from(query)?;
    Ok(Json(page_entries(state.cache.entries(), &params)))
}

async fn summary_handler(State(state): State<Arc<ApiState>>) -> Json<BondSummary> {
    Json(summarize(&state.cache.entries()))
}

async fn status_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let snapshot = state.cache.snapshot();
    let mut body = String::with_capacity(snapshot.iter().map(|s| s.len() + 1).sum());
    for status in &snapshot {
        body.push_str(status);
        body.push('\n');
    }

    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| subscriber_session(socket, registry))
}

/// Pump batches from the registry queue into one WebSocket until either
/// side goes away.
async fn subscriber_session(socket: WebSocket, registry: Arc<SubscriberRegistry>) {
    let (id, mut batches) = registry.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            maybe_batch = batches.recv() => match maybe_batch {
                Some(batch) => {
                    if ws_tx.send(Message::Text(batch.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                // Queue closed: the registry pruned this subscriber.
                None => break,
            },
            maybe_msg = ws_rx.next() => match maybe_msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    registry.unregister(id);
    let _ = ws_tx.close().await;
}

// =============================================================================
// Query Transformation
// =============================================================================

fn page_entries(entries: Vec<Arc<EnrichedBond>>, params: &QueryParams) -> BondPageResponse {
    let search_lower = params.search.as_ref().map(|s| s.to_lowercase());

    let mut matching: Vec<Arc<EnrichedBond>> = entries
        .into_iter()
        .filter(|bond| {
            if let Some(needle) = &search_lower
                && !bond.id.to_lowercase().contains(needle)
            {
                return false;
            }
            if params.min_price.is_some_and(|min| bond.price < min) {
                return false;
            }
            if params.max_price.is_some_and(|max| bond.price > max) {
                return false;
            }
            if params.min_yield.is_some_and(|min| bond.current_yield < min) {
                return false;
            }
            if params.max_yield.is_some_and(|max| bond.current_yield > max) {
                return false;
            }
            true
        })
        .collect();

    if let Some((field, dir)) = params.sort {
        matching.sort_by(|a, b| {
            let ordering = match field {
                SortField::Id => a.id.cmp(&b.id),
                SortField::Price => a.price.cmp(&b.price),
                SortField::Yield => a.current_yield.total_cmp(&b.current_yield),
                SortField::Coupon => a.coupon.cmp(&b.coupon),
            };
            match dir {
                SortDir::Asc => ordering,
                SortDir::Desc => ordering.reverse(),
            }
        });
    }

    let total_count = matching.len();
    let total_pages = total_count.div_ceil(params.size);

    let data: Vec<EnrichedBond> = matching
        .into_iter()
        .skip((params.page - 1) * params.size)
        .take(params.size)
        .map(|bond| (*bond).clone())
        .collect();

    BondPageResponse {
        data,
        page: params.page,
        size: params.size,
        total_count,
        total_pages,
        has_next: params.page * params.size < total_count,
        has_previous: params.page > 1,
    }
}

fn summarize(entries: &[Arc<EnrichedBond>]) -> BondSummary {
    if entries.is_empty() {
        return BondSummary::default();
    }

    let count = entries.len();
    let price_sum: i64 = entries.iter().map(|b| b.price).sum();
    let yield_sum: f64 = entries.iter().map(|b| b.current_yield).sum();

    BondSummary {
        total_bonds: count,
        average_price: price_sum as f64 / count as f64,
        average_yield: yield_sum / count as f64,
        min_price: entries.iter().map(|b| b.price).min().unwrap_or_default(),
        max_price: entries.iter().map(|b| b.price).max().unwrap_or_default(),
        min_yield: entries
            .iter()
            .map(|b| b.current_yield)
            .fold(f64::INFINITY, f64::min),
        max_yield: entries
            .iter()
            .map(|b| b.current_yield)
            .fold(f64::NEG_INFINITY, f64::max),
    }
}

// =============================================================================
// Tests
// =============================================================================
