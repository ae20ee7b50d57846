use std::{future::Future, time::Duration};

use axum::{Json, Router, routing::get};
use jsonwebtoken::{EncodingKey, Header};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::models::Backend;

/// Serves `app` on an ephemeral local port and returns its base URL.
pub(crate) async fn spawn_upstream(app: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .unwrap();
    });

    (base_url, handle)
}

pub(crate) fn backend(base_url: &str, api_key: Option<&str>) -> Backend {
    let spec = match api_key {
        Some(key) => format!("{base_url}/v1|{key}"),
        None => format!("{base_url}/v1"),
    };
    spec.parse().unwrap()
}

/// Upstream that lists `ids` on `GET /v1/models`, tagged with `owner`.
pub(crate) fn models_router(ids: &[&str], owner: &str) -> Router {
    let listing = models_listing(ids, owner);
    Router::new().route(
        "/v1/models",
        get(move || {
            let listing = listing.clone();
            async move { Json(listing) }
        }),
    )
}

pub(crate) fn models_listing(ids: &[&str], owner: &str) -> Value {
    let data: Vec<Value> = ids
        .iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": owner}))
        .collect();
    json!({"object": "list", "data": data})
}

/// Polls `check` until it holds, failing the test after about two seconds.
pub(crate) async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

/// HS256 token over `claims`, signed with `secret`.
pub(crate) fn sign_session(secret: &str, claims: &Value) -> String {
    jsonwebtoken::encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
