use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::RelayError;

pub const DEFAULT_PATH_PREFIX: &str = "/v1";
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// An upstream model server, parsed from `<url>[|<api_key>]`.
///
/// The URL's path becomes the prefix that replaces the inbound `/v1`
/// segment; a bare origin gets [`DEFAULT_PATH_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub base_url: String,
    pub path_prefix: String,
    pub api_key: Option<String>,
}

impl Backend {
    /// Absolute URL of `suffix` under this backend's prefix.
    pub fn endpoint(&self, suffix: &str) -> String {
        format!("{}{}{}", self.base_url, self.path_prefix, suffix)
    }

    pub fn models_url(&self) -> String {
        self.endpoint("/models")
    }
}

impl FromStr for Backend {
    type Err = RelayError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (raw_url, api_key) = match spec.split_once('|') {
            Some((url, key)) => (url.trim(), Some(key.trim())),
            None => (spec.trim(), None),
        };
        let invalid = |reason: &str| RelayError::InvalidBackend {
            spec: raw_url.to_owned(),
            reason: reason.to_owned(),
        };

        let url = Url::parse(raw_url).map_err(|err| invalid(&err.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host"));
        }

        let path = url.path().trim_end_matches('/');
        let path_prefix = if path.is_empty() {
            DEFAULT_PATH_PREFIX.to_owned()
        } else {
            path.to_owned()
        };

        Ok(Self {
            base_url: origin_from_url(&url),
            path_prefix,
            api_key: api_key.filter(|key| !key.is_empty()).map(str::to_owned),
        })
    }
}

/// A model served by a backend, as reported by the backend's listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub model_id: String,
    pub backend: Backend,
    pub model: Value,
}

#[derive(Debug, Default)]
struct Snapshot {
    entries: Arc<Vec<ModelEntry>>,
    by_id: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    data: Vec<Value>,
}

/// Model id → backend routing table, rebuilt from every backend's listing.
#[derive(Debug)]
pub struct ModelRegistry {
    client: Client,
    backends: Vec<Backend>,
    fetch_timeout: Duration,
    current: RwLock<Arc<Snapshot>>,
}

impl ModelRegistry {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self::with_client(Client::new(), backends, DEFAULT_FETCH_TIMEOUT)
    }

    pub fn with_client(client: Client, backends: Vec<Backend>, fetch_timeout: Duration) -> Self {
        Self {
            client,
            backends,
            fetch_timeout,
            current: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Queries every backend in order and swaps in the combined listing.
    /// A backend that fails contributes nothing to this cycle. Returns the
    /// number of models committed.
    pub async fn refresh(&self) -> usize {
        let mut entries: Vec<ModelEntry> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for backend in &self.backends {
            let models = match self.fetch_models(backend).await {
                Ok(models) => models,
                Err(err) => {
                    warn!(backend = %backend.base_url, error = %err, "failed to fetch model listing");
                    continue;
                }
            };

            for model in models {
                let Some(model_id) = model.get("id").and_then(Value::as_str).map(str::to_owned)
                else {
                    debug!(backend = %backend.base_url, "skipping model without string id");
                    continue;
                };
                let entry = ModelEntry {
                    model_id: model_id.clone(),
                    backend: backend.clone(),
                    model,
                };
                // later backends take over an id but keep its listing position
                match by_id.get(&model_id) {
                    Some(&idx) => entries[idx] = entry,
                    None => {
                        by_id.insert(model_id, entries.len());
                        entries.push(entry);
                    }
                }
            }
        }

        let count = entries.len();
        let next = Arc::new(Snapshot {
            entries: Arc::new(entries),
            by_id,
        });
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        info!(models = count, backends = self.backends.len(), "model registry refreshed");
        count
    }

    async fn fetch_models(&self, backend: &Backend) -> Result<Vec<Value>, RelayError> {
        let mut request = self
            .client
            .get(backend.models_url())
            .timeout(self.fetch_timeout);
        if let Some(key) = backend.api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let listing: ModelListing = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(RelayError::Gateway)?
            .json()
            .await
            .map_err(RelayError::Gateway)?;
        Ok(listing.data)
    }

    fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Backend serving `model_id`, or the first configured backend when no
    /// listing claims it. `None` only when no backend is configured.
    pub fn resolve(&self, model_id: &str) -> Option<Backend> {
        let snapshot = self.current();
        snapshot
            .by_id
            .get(model_id)
            .and_then(|idx| snapshot.entries.get(*idx))
            .map(|entry| entry.backend.clone())
            .or_else(|| self.backends.first().cloned())
    }

    pub fn snapshot(&self) -> Arc<Vec<ModelEntry>> {
        self.current().entries.clone()
    }

    /// Refreshes every `every`, starting one interval from now.
    pub fn spawn_refresh(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                self.refresh().await;
            }
        })
    }
}

fn origin_from_url(url: &Url) -> String {
    let mut origin = match url.host_str() {
        Some(host) => format!("{}://{}", url.scheme(), host),
        None => url.as_str().to_string(),
    };

    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }

    origin
}
