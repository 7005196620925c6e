use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::{FallbackTransport, StoreError, StorePath, StoreResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// REST view of the realtime store: every path maps to `{base}/{path}.json`.
#[derive(Debug, Clone)]
pub struct HttpFallback {
    client: Client,
    base: Url,
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    name: String,
}

impl HttpFallback {
    pub fn new(base: Url) -> StoreResult<Self> {
        Self::with_timeout(base, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base: Url, timeout: Duration) -> StoreResult<Self> {
        if base.cannot_be_a_base() {
            return Err(StoreError::InvalidPath {
                path: base.to_string(),
                reason: "fallback base url cannot carry a path",
            });
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(http_error)?;
        Ok(Self {
            client,
            base,
            auth: None,
        })
    }

    /// Appends `auth=<token>` to every request.
    pub fn with_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(token.into());
        self
    }

    pub fn url_for(&self, path: &StorePath) -> StoreResult<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| StoreError::InvalidPath {
                path: self.base.to_string(),
                reason: "fallback base url cannot carry a path",
            })?;
            segments.pop_if_empty();
            match path.segments().split_last() {
                Some((last, parents)) => {
                    segments.extend(parents);
                    segments.push(&format!("{last}.json"));
                }
                None => {
                    segments.push(".json");
                }
            }
        }
        if let Some(token) = &self.auth {
            url.query_pairs_mut().append_pair("auth", token);
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        path: &StorePath,
        body: Option<&Value>,
    ) -> StoreResult<reqwest::Response> {
        let url = self.url_for(path)?;
        tracing::trace!(target = "parley::store::http", %method, %path, "fallback request");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(http_error)?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(StoreError::Http {
            status: Some(status.as_u16()),
            message,
        })
    }
}

#[async_trait]
impl FallbackTransport for HttpFallback {
    async fn get(&self, path: &StorePath) -> StoreResult<Option<Value>> {
        let response = self.send(Method::GET, path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = response.json::<Value>().await.map_err(http_error)?;
        Ok((!value.is_null()).then_some(value))
    }

    async fn put(&self, path: &StorePath, value: Value) -> StoreResult<()> {
        self.send(Method::PUT, path, Some(&value)).await.map(drop)
    }

    async fn post(&self, path: &StorePath, value: Value) -> StoreResult<String> {
        let response = self.send(Method::POST, path, Some(&value)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::Http {
                status: Some(StatusCode::NOT_FOUND.as_u16()),
                message: format!("cannot append under {path}"),
            });
        }
        let created = response.json::<PostResponse>().await.map_err(http_error)?;
        Ok(created.name)
    }

    async fn patch(&self, path: &StorePath, partial: Value) -> StoreResult<()> {
        if !partial.is_object() {
            return Err(StoreError::Codec("update payload must be an object".into()));
        }
        self.send(Method::PATCH, path, Some(&partial)).await.map(drop)
    }

    async fn delete(&self, path: &StorePath) -> StoreResult<()> {
        self.send(Method::DELETE, path, None).await.map(drop)
    }
}

fn http_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        return StoreError::Timeout;
    }
    if err.is_decode() {
        return StoreError::Codec(err.to_string());
    }
    StoreError::Http {
        status: err.status().map(|status| status.as_u16()),
        message: err.to_string(),
    }
}
