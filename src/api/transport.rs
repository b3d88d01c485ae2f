//! HTTP seam between the reconciliation client and the backend.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::ApiError;

/// A file uploaded alongside a sell request (photo, RC book, insurance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
  /// Form field name, e.g. `photos` or `rc_document`
  pub field: String,
  pub path: PathBuf,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
  Empty,
  Json(Value),
  /// Form fields plus files, sent as `multipart/form-data`
  Multipart {
    fields: Value,
    attachments: Vec<Attachment>,
  },
}

/// A request relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub bearer: Option<String>,
  /// Validator for a conditional GET
  pub if_none_match: Option<String>,
  pub body: RequestBody,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      bearer: None,
      if_none_match: None,
      body: RequestBody::Empty,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn with_query(mut self, key: &str, value: &str) -> Self {
    self.query.push((key.to_string(), value.to_string()));
    self
  }

  pub fn with_validator(mut self, validator: Option<String>) -> Self {
    self.if_none_match = validator;
    self
  }

  pub fn with_body(mut self, body: RequestBody) -> Self {
    self.body = body;
    self
  }
}

/// Status, validator and decoded body of a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub etag: Option<String>,
  pub body: Value,
}

impl ApiResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_not_modified(&self) -> bool {
    self.status == 304
  }
}

/// Sends requests to the backend.
///
/// Implementations only fail for transport-level problems (connection
/// refused, DNS, timeouts), as `ApiError::Transient`. Non-2xx statuses are
/// returned as responses and classified by the client.
pub trait Transport: Send + Sync {
  fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, ApiError>>;
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    // Paths are joined relative to the base, so it must end in a slash
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base_url =
      Url::parse(&normalized).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .gzip(true)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client, base_url })
  }

  async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
    let url = self
      .base_url
      .join(request.path.trim_start_matches('/'))
      .map_err(|e| ApiError::Validation {
        message: format!("invalid request path {}: {}", request.path, e),
        fields: Default::default(),
      })?;

    let mut builder = self
      .client
      .request(request.method.clone(), url)
      .header(ACCEPT, "application/json");

    if !request.query.is_empty() {
      builder = builder.query(&request.query);
    }
    if let Some(token) = &request.bearer {
      builder = builder.bearer_auth(token);
    }
    if let Some(validator) = &request.if_none_match {
      builder = builder.header(IF_NONE_MATCH, validator.as_str());
    }

    builder = match request.body {
      RequestBody::Empty => builder,
      RequestBody::Json(body) => builder.json(&body),
      RequestBody::Multipart {
        fields,
        attachments,
      } => builder.multipart(build_form(&fields, &attachments).await?),
    };

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::Transient(describe(&e)))?;

    let status = response.status().as_u16();
    let etag = response
      .headers()
      .get(ETAG)
      .and_then(|v| v.to_str().ok())
      .map(String::from);

    let bytes = response
      .bytes()
      .await
      .map_err(|e| ApiError::Transient(describe(&e)))?;
    let body = if bytes.is_empty() {
      Value::Null
    } else {
      serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    Ok(ApiResponse { status, etag, body })
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: ApiRequest) -> BoxFuture<'_, Result<ApiResponse, ApiError>> {
    Box::pin(self.execute(request))
  }
}

fn describe(e: &reqwest::Error) -> String {
  if e.is_timeout() {
    format!("request timed out: {}", e)
  } else if e.is_connect() {
    format!("connection failed: {}", e)
  } else {
    e.to_string()
  }
}

/// Form fields become text parts. Nested objects are sent as JSON text.
async fn build_form(fields: &Value, attachments: &[Attachment]) -> Result<Form, ApiError> {
  let mut form = Form::new();

  if let Some(map) = fields.as_object() {
    for (name, value) in map {
      let text = match value {
        Value::Null => continue,
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      form = form.text(name.clone(), text);
    }
  }

  for attachment in attachments {
    let data = tokio::fs::read(&attachment.path)
      .await
      .map_err(|e| ApiError::Validation {
        message: format!("cannot read {}: {}", attachment.path.display(), e),
        fields: Default::default(),
      })?;

    let file_name = attachment
      .path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_else(|| attachment.field.clone());

    let mut part = Part::bytes(data).file_name(file_name);
    if let Some(content_type) = &attachment.content_type {
      part = part.mime_str(content_type).map_err(|e| ApiError::Validation {
        message: format!("invalid content type {}: {}", content_type, e),
        fields: Default::default(),
      })?;
    }
    form = form.part(attachment.field.clone(), part);
  }

  Ok(form)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_gets_trailing_slash() {
    let transport = HttpTransport::new("https://api.example.com/api", Duration::from_secs(5)).unwrap();
    assert_eq!(
      transport
        .base_url
        .join("marketplace/vehicles/1/")
        .unwrap()
        .as_str(),
      "https://api.example.com/api/marketplace/vehicles/1/"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(HttpTransport::new("not a url", Duration::from_secs(5)).is_err());
  }

  #[test]
  fn test_response_status_helpers() {
    let response = ApiResponse {
      status: 304,
      etag: None,
      body: Value::Null,
    };
    assert!(response.is_not_modified());
    assert!(!response.is_success());
  }
}
