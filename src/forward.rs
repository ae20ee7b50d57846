use std::{io, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode,
        header::{AUTHORIZATION, CONTENT_LENGTH, HOST},
    },
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{error::RelayError, models::ModelRegistry};

/// Inbound path segment that is replaced by a backend's own prefix.
pub const API_VERSION_PREFIX: &str = "/v1";
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);

// How much of a rejected backend body is kept for the log line.
const ERROR_BODY_LIMIT: usize = 4 * 1024;

/// Inbound request handed to the proxy.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Accepted backend response; the body has not been read yet.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    upstream: reqwest::Response,
}

/// How a relayed body ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug)]
pub enum Forwarded {
    /// Not a model request; the caller should fall through.
    Declined,
    Relayed(ProxyResponse),
}

/// Routes model requests to the backend that serves the requested model.
#[derive(Debug, Clone)]
pub struct ForwardingProxy {
    client: Client,
    registry: Arc<ModelRegistry>,
    upstream_timeout: Duration,
}

impl ForwardingProxy {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self::with_client(Client::new(), registry, DEFAULT_UPSTREAM_TIMEOUT)
    }

    pub fn with_client(
        client: Client,
        registry: Arc<ModelRegistry>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            client,
            registry,
            upstream_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub async fn forward(&self, request: ProxyRequest) -> Result<Forwarded, RelayError> {
        if request.method != Method::POST || !has_version_prefix(&request.path) {
            return Ok(Forwarded::Declined);
        }
        let Some(model) = forwardable_model(&request.body) else {
            return Ok(Forwarded::Declined);
        };
        let Some(backend) = self.registry.resolve(&model) else {
            warn!(model = %model, "no backend configured");
            return Ok(Forwarded::Declined);
        };

        let url = backend_url(
            &backend.base_url,
            &backend.path_prefix,
            &request.path,
            request.query.as_deref(),
        );
        let headers = outbound_headers(&request.headers, backend.api_key.as_deref());
        debug!(model = %model, backend = %backend.base_url, url = %url, "forwarding request");

        let send = self
            .client
            .request(request.method, url.as_str())
            .headers(headers)
            .body(request.body)
            .send();

        let upstream = match tokio::time::timeout(self.upstream_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                warn!(model = %model, backend = %backend.base_url, error = %err, "backend request failed");
                return Err(RelayError::Gateway(err));
            }
            Err(_) => {
                warn!(model = %model, backend = %backend.base_url, timeout = ?self.upstream_timeout, "backend timed out");
                return Err(RelayError::GatewayTimeout(self.upstream_timeout));
            }
        };

        let status = upstream.status();
        if status.is_client_error() || status.is_server_error() {
            let detail = read_capped(upstream, ERROR_BODY_LIMIT).await;
            warn!(
                model = %model,
                backend = %backend.base_url,
                status = status.as_u16(),
                body = %detail,
                "backend rejected request"
            );
            return Err(RelayError::Backend { status });
        }

        Ok(Forwarded::Relayed(ProxyResponse {
            status,
            headers: upstream.headers().clone(),
            upstream,
        }))
    }
}

impl ProxyResponse {
    /// Streams the backend body to the client. `done` receives how the relay
    /// ended, including when the client goes away mid-body.
    pub fn into_response(self, done: oneshot::Sender<RelayOutcome>) -> Response<Body> {
        let mut resp = Response::new(Body::from_stream(relay_body(self.upstream, done)));
        *resp.status_mut() = self.status;
        copy_upstream_response_headers(&self.headers, resp.headers_mut());
        resp
    }
}

struct CompletionSignal(Option<oneshot::Sender<RelayOutcome>>);

impl CompletionSignal {
    fn finish(&mut self, outcome: RelayOutcome) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.finish(RelayOutcome::Cancelled);
    }
}

fn relay_body(
    upstream: reqwest::Response,
    done: oneshot::Sender<RelayOutcome>,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut signal = CompletionSignal(Some(done));
        let expected = upstream.content_length();
        let mut received: u64 = 0;
        let mut chunks = upstream.bytes_stream();

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    received += bytes.len() as u64;
                    // a length-delimited body may not be polled past its last byte
                    if expected == Some(received) {
                        signal.finish(RelayOutcome::Completed);
                    }
                    yield Ok(bytes);
                }
                Err(err) => {
                    warn!(error = %err, "backend stream failed");
                    signal.finish(RelayOutcome::Failed);
                    yield Err(io::Error::other(err));
                    break;
                }
            }
        }
        signal.finish(RelayOutcome::Completed);
    }
}

async fn read_capped(upstream: reqwest::Response, limit: usize) -> String {
    let mut collected = Vec::new();
    let mut chunks = upstream.bytes_stream();
    while let Some(Ok(chunk)) = chunks.next().await {
        let room = limit.saturating_sub(collected.len());
        collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if collected.len() >= limit {
            break;
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// True for paths below `/v1/`. The bare version root is not a model call.
pub fn has_version_prefix(path: &str) -> bool {
    path.strip_prefix(API_VERSION_PREFIX)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// The `model` field of a JSON body, stringified when it is not a string.
pub fn forwardable_model(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("model")? {
        Value::Null => None,
        Value::String(model) => Some(model.clone()),
        other => Some(other.to_string()),
    }
}

fn backend_url(base_url: &str, path_prefix: &str, path: &str, query: Option<&str>) -> String {
    let suffix = path.strip_prefix(API_VERSION_PREFIX).unwrap_or(path);
    let mut url = format!("{base_url}{path_prefix}{suffix}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    use axum::http::header;

    name == header::CONNECTION
        || name.as_str() == "keep-alive"
        || name == header::PROXY_AUTHENTICATE
        || name == header::PROXY_AUTHORIZATION
        || name == header::TE
        || name == header::TRAILER
        || name == header::TRANSFER_ENCODING
        || name == header::UPGRADE
}

/// Inbound headers minus transport headers and the caller's credential,
/// plus the backend credential when one is configured.
fn outbound_headers(inbound: &HeaderMap, api_key: Option<&str>) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if is_hop_by_hop_header(name) {
            continue;
        }
        if name == HOST || name == CONTENT_LENGTH || name == AUTHORIZATION {
            continue;
        }
        out.append(name, value.clone());
    }

    if let Some(key) = api_key {
        match HeaderValue::from_str(&format!("Bearer {key}")) {
            Ok(value) => {
                out.insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("backend api key is not a valid header value"),
        }
    }
    out
}

fn copy_upstream_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if is_hop_by_hop_header(name) {
            continue;
        }
        to.append(name, value.clone());
    }
}
