use crate::api::types::{Collection, Statistics};
use crate::config::Config;
use color_eyre::{eyre::eyre, Report, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Failure of a single REST call
#[derive(Debug)]
pub enum RequestError {
  /// The request could not be sent or its response not received
  Transport { what: String, source: reqwest::Error },
  /// The backend answered with a non-success status
  Status {
    what: String,
    status: StatusCode,
    body: String,
  },
}

impl RequestError {
  /// Transport failures and 5xx may go away when the call is repeated
  pub fn is_transient(&self) -> bool {
    match self {
      RequestError::Transport { .. } => true,
      RequestError::Status { status, .. } => status.is_server_error(),
    }
  }

  /// The connection was never established, so the backend saw nothing
  pub fn never_sent(&self) -> bool {
    matches!(self, RequestError::Transport { source, .. } if source.is_connect())
  }
}

impl fmt::Display for RequestError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RequestError::Transport { what, source } => write!(f, "Failed to {}: {}", what, source),
      RequestError::Status { what, status, body } => {
        write!(f, "Failed to {}: {} {}", what, status, body)
      }
    }
  }
}

impl std::error::Error for RequestError {}

/// Retry predicate for idempotent calls (PUT, DELETE)
pub fn is_transient(e: &Report) -> bool {
  e.downcast_ref::<RequestError>()
    .is_some_and(RequestError::is_transient)
}

/// Retry predicate for creates: resending after the backend may have seen
/// the request could store the record twice
pub fn never_sent(e: &Report) -> bool {
  e.downcast_ref::<RequestError>()
    .is_some_and(RequestError::never_sent)
}

/// Client Hub REST API client
#[derive(Clone)]
pub struct RestClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl RestClient {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_base_url(
      &config.backend.url,
      Config::get_api_token(),
      Duration::from_secs(config.backend.timeout_secs),
    )
  }

  pub fn with_base_url(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
    // Url::join drops the last segment unless the base ends with a slash
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base_url =
      Url::parse(&normalized).map_err(|e| eyre!("Invalid backend URL {}: {}", base_url, e))?;

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token,
    })
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))?;

    let builder = self.http.request(method, url);
    Ok(match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    })
  }

  async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
    let response = builder
      .send()
      .await
      .map_err(|source| RequestError::Transport {
        what: what.to_string(),
        source,
      })?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(
      RequestError::Status {
        what: what.to_string(),
        status,
        body: body.trim().to_string(),
      }
      .into(),
    )
  }

  async fn json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response to {}: {}", what, e))
  }

  /// List every record of a collection
  pub async fn list<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>> {
    let what = format!("list {}", collection.path());
    let response = self
      .send(self.request(Method::GET, collection.path())?, &what)
      .await?;
    Self::json(response, &what).await
  }

  /// Create a record; the backend answers with the stored record
  pub async fn create<B, T>(&self, collection: Collection, body: &B) -> Result<T>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let what = format!("create in {}", collection.path());
    let response = self
      .send(
        self.request(Method::POST, collection.path())?.json(body),
        &what,
      )
      .await?;
    Self::json(response, &what).await
  }

  /// Replace a record
  pub async fn update<B, T>(&self, collection: Collection, id: i64, body: &B) -> Result<T>
  where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
  {
    let path = format!("{}/{}", collection.path(), id);
    let what = format!("update {}", path);
    let response = self
      .send(self.request(Method::PUT, &path)?.json(body), &what)
      .await?;
    Self::json(response, &what).await
  }

  pub async fn delete(&self, collection: Collection, id: i64) -> Result<()> {
    let path = format!("{}/{}", collection.path(), id);
    let what = format!("delete {}", path);
    self.send(self.request(Method::DELETE, &path)?, &what).await?;
    Ok(())
  }

  pub async fn statistics(&self) -> Result<Statistics> {
    let what = "load statistics";
    let response = self
      .send(
        self.request(Method::GET, Collection::Statistics.path())?,
        what,
      )
      .await?;
    Self::json(response, what).await
  }
}
