use std::{error::Error as StdError, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    async_trait,
    body,
    extract::{FromRequestParts, Path, Query, Request, State, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
};
use http_body_util::LengthLimitError;
use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpListener, sync::oneshot};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{
    DAY_MS,
    auth::{AuthGate, SessionVerifier, bearer_token},
    error::RelayError,
    forward::{Forwarded, ForwardingProxy, ProxyRequest},
    keys::{KeyRecord, KeyStore},
    models::ModelRegistry,
    now_millis,
    usage::{DEFAULT_WINDOW_MS, UsageLog},
};

/// Default cap on inbound request bodies.
pub const DEFAULT_BODY_LIMIT: usize = 1024 * 1024;

// Analytics dates must fall within this distance of now.
const ANALYTICS_HORIZON_MS: i64 = 365 * DAY_MS;

#[derive(Clone, Debug)]
pub struct AppState {
    keys: Arc<KeyStore>,
    usage: Arc<UsageLog>,
    registry: Arc<ModelRegistry>,
    proxy: ForwardingProxy,
    gate: AuthGate,
    session: SessionVerifier,
    body_limit: usize,
}

impl AppState {
    pub fn new(
        keys: Arc<KeyStore>,
        usage: Arc<UsageLog>,
        proxy: ForwardingProxy,
        session: SessionVerifier,
    ) -> Self {
        Self {
            gate: AuthGate::new(keys.clone(), usage.clone()),
            registry: proxy.registry().clone(),
            keys,
            usage,
            proxy,
            session,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }
}

/// Error rendered for the key management and analytics routes.
struct AdminError(RelayError);

impl From<RelayError> for AdminError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        if self.0.is_internal() {
            error!(error = %self.0, "admin request failed");
        }
        let body = json!({"success": false, "message": self.0.public_message()});
        (self.0.status(), Json(body)).into_response()
    }
}

/// Error rendered for the API-key authenticated proxy routes.
struct ProxyFailure(RelayError);

impl IntoResponse for ProxyFailure {
    fn into_response(self) -> Response {
        if self.0.is_internal() {
            error!(error = %self.0, "proxy request failed");
        }
        let body = json!({"error": self.0.public_message()});
        (self.0.status(), Json(body)).into_response()
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn require_session(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        warn!("admin request without session token");
        return AdminError(RelayError::Unauthorized(
            "Missing or invalid Authorization header".to_owned(),
        ))
        .into_response();
    };

    if let Err(err) = state.session.verify(token) {
        warn!(error = %err, "session verification failed");
        return AdminError(err).into_response();
    }
    next.run(req).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody {
    #[serde(default)]
    owner_label: Option<String>,
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateKeyBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let Json(body) =
        payload.map_err(|err| RelayError::InvalidInput(format!("invalid request body: {err}")))?;
    let owner_label = body
        .owner_label
        .ok_or_else(|| RelayError::InvalidInput("ownerLabel is required".to_owned()))?;

    let record = state.keys.create(&owner_label).await?;
    Ok(Json(json!({"success": true, "key": record})))
}

async fn list_keys(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({"success": true, "keys": state.keys.list().await}))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    state.keys.delete(&id).await?;
    Ok(Json(json!({"success": true})))
}

async fn validate_key(
    State(state): State<Arc<AppState>>,
    Path(secret): Path<String>,
) -> Json<serde_json::Value> {
    match state.keys.validate(&secret).await {
        Some(record) => Json(json!({"valid": true, "ownerLabel": record.owner_label})),
        None => Json(json!({"valid": false})),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyticsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

async fn key_analytics(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<serde_json::Value>, AdminError> {
    if !is_key_id(&key_id) {
        return Err(RelayError::InvalidInput("keyId must be 64 lowercase hex characters".to_owned()).into());
    }

    let now = now_millis();
    let start = parse_date("startDate", query.start_date.as_deref(), now)?;
    let end = parse_date("endDate", query.end_date.as_deref(), now)?;
    if let (Some(start), Some(end)) = (start, end)
        && start >= end
    {
        return Err(RelayError::InvalidInput("startDate must be before endDate".to_owned()).into());
    }

    let record = state
        .keys
        .get_by_id(&key_id)
        .await
        .ok_or_else(|| RelayError::NotFound("API key not found".to_owned()))?;

    let records = if start.is_none() && end.is_none() {
        state
            .usage
            .query_last_window(&record.secret, DEFAULT_WINDOW_MS)
            .await?
    } else {
        state.usage.query(&record.secret, start, end).await?
    };

    Ok(Json(json!({"success": true, "records": records})))
}

fn is_key_id(raw: &str) -> bool {
    raw.len() == 64 && raw.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Epoch-millisecond query value; blank counts as absent.
fn parse_date(name: &str, raw: Option<&str>, now: i64) -> Result<Option<i64>, RelayError> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let value: i64 = raw
        .parse()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| RelayError::InvalidInput(format!("{name} must be a positive timestamp")))?;
    if (value - now).abs() > ANALYTICS_HORIZON_MS {
        return Err(RelayError::InvalidInput(format!(
            "{name} must be within one year of now"
        )));
    }
    Ok(Some(value))
}

/// Extractor for routes that require an issued API key.
struct ApiCaller(KeyRecord);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ApiCaller {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        state
            .gate
            .authenticate(&parts.headers)
            .await
            .map(ApiCaller)
            .map_err(|err| ProxyFailure(err).into_response())
    }
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    _caller: ApiCaller,
) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .registry
        .snapshot()
        .iter()
        .map(|entry| entry.model.clone())
        .collect();
    Json(json!({"data": data, "object": "list"}))
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    ApiCaller(caller): ApiCaller,
    req: Request,
) -> Response {
    let (parts, body) = req.into_parts();
    let body_bytes = match body::to_bytes(body, state.body_limit).await {
        Ok(bytes) => bytes,
        Err(err) if exceeds_length_limit(&err) => {
            warn!(key_id = %caller.id, limit = state.body_limit, "request body too large");
            return ProxyFailure(RelayError::PayloadTooLarge {
                limit: state.body_limit,
            })
            .into_response();
        }
        Err(err) => {
            warn!(key_id = %caller.id, error = %err, "failed to read request body");
            return ProxyFailure(RelayError::InvalidInput(
                "request body could not be read".to_owned(),
            ))
            .into_response();
        }
    };

    // timing starts once the request is ready to forward
    let ticket = state.gate.track(&caller.secret);

    let proxy_request = ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_owned(),
        query: parts.uri.query().map(str::to_owned),
        headers: parts.headers,
        body: body_bytes,
    };

    match state.proxy.forward(proxy_request).await {
        Ok(Forwarded::Relayed(resp)) => {
            let (done_tx, done_rx) = oneshot::channel();
            ticket.watch(done_rx);
            resp.into_response(done_tx)
        }
        Ok(Forwarded::Declined) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": "Not Found"}))).into_response()
        }
        Err(err) => {
            ticket.finish(None);
            ProxyFailure(err).into_response()
        }
    }
}

fn exceeds_length_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(current) = source {
        if current.is::<LengthLimitError>() {
            return true;
        }
        source = current.source();
    }
    false
}

pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/validate/:secret", get(validate_key))
        .route("/keys/:id", delete(delete_key))
        .route("/analytics/:key_id", get(key_analytics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/models", get(list_models))
        .merge(admin)
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "model relay listening");

    axum::serve(listener, router(Arc::new(state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
