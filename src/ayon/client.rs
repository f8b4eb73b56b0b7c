use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::BoxFuture;
use crate::config::Config;
use crate::error::{SyncError, SyncResult};

/// Transport used by the endpoint catalogue.
///
/// `path` starts at the server's base url (`/api/...`, `/graphql`) and may
/// carry a query string.
/// Implementations map transport failures to `SyncError::Network` and non-2xx
/// answers to `SyncError::Server`.
pub trait Backend: Send + Sync + 'static {
  fn request(&self, method: Method, path: String, body: Option<Value>) -> BoxFuture<Value>;
}

/// POST a GraphQL document to `/graphql`.
pub fn graphql(backend: &dyn Backend, query: &str, variables: Value) -> BoxFuture<Value> {
  backend.request(
    Method::POST,
    "/graphql".to_string(),
    Some(json!({ "query": query, "variables": variables })),
  )
}

/// AYON REST client
#[derive(Clone)]
pub struct RestClient {
  client: reqwest::Client,
  base: Arc<Url>,
}

impl RestClient {
  pub fn new(config: &Config) -> Result<Self> {
    let key = Config::get_api_key()?;
    Self::with_key(&config.server.url, &key, config.server.timeout())
  }

  pub fn with_key(server_url: &str, key: &str, timeout: Duration) -> Result<Self> {
    let base = base_url(server_url)?;

    let mut headers = HeaderMap::new();
    let auth = HeaderValue::from_str(&format!("Bearer {}", key))
      .map_err(|e| eyre!("Invalid API key: {}", e))?;
    headers.insert(AUTHORIZATION, auth);

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base: Arc::new(base),
    })
  }

  async fn send(&self, method: Method, path: String, body: Option<Value>) -> SyncResult<Value> {
    let url = endpoint_url(&self.base, &path)?;
    debug!(%method, %url, "request");

    let mut request = self.client.request(method, url);
    if let Some(body) = &body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?;
    let status = response.status();
    let text = response
      .text()
      .await
      .map_err(|e| SyncError::Network(e.to_string()))?;
    let parsed: Option<Value> = serde_json::from_str(&text).ok();

    if !status.is_success() {
      return Err(SyncError::server(status.as_u16(), parsed.as_ref()));
    }
    // 204 and friends
    Ok(parsed.unwrap_or(Value::Null))
  }
}

/// Parse the configured server url. A path prefix is kept for every request.
fn base_url(server_url: &str) -> Result<Url> {
  let mut base =
    Url::parse(server_url).map_err(|e| eyre!("Invalid server url {}: {}", server_url, e))?;
  if !base.path().ends_with('/') {
    let path = format!("{}/", base.path());
    base.set_path(&path);
  }
  Ok(base)
}

fn endpoint_url(base: &Url, path: &str) -> SyncResult<Url> {
  base
    .join(path.trim_start_matches('/'))
    .map_err(|e| SyncError::Network(format!("invalid path {}: {}", path, e)))
}

impl Backend for RestClient {
  fn request(&self, method: Method, path: String, body: Option<Value>) -> BoxFuture<Value> {
    let client = self.clone();
    Box::pin(async move { client.send(method, path, body).await })
  }
}
