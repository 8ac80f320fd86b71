//! PostgREST-style HTTP adapter for the data service.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::{row_id, DataService};
use crate::error::ServiceError;
use crate::offline::OperationKind;

/// Data service reached over HTTP.
///
/// Rows are addressed as `<base>/<table>?id=eq.<id>`; responses are JSON
/// arrays of rows.
#[derive(Debug, Clone)]
pub struct RestDataService {
  client: reqwest::Client,
  base: Url,
  api_key: Option<String>,
  timeout: Duration,
}

impl RestDataService {
  pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, ServiceError> {
    let mut base = Url::parse(base_url)
      .map_err(|e| ServiceError::validation(format!("Invalid service URL {}: {}", base_url, e)))?;
    if base.cannot_be_a_base() {
      return Err(ServiceError::validation(format!(
        "Service URL {} cannot be used as a base",
        base_url
      )));
    }
    // Keep the trailing path segment when tables are appended
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| ServiceError::other(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      api_key,
      timeout,
    })
  }

  fn table_url(&self, table: &str, id: Option<&str>) -> Result<Url, ServiceError> {
    let mut url = self
      .base
      .join(table)
      .map_err(|e| ServiceError::validation(format!("Invalid table name {}: {}", table, e)))?;
    if let Some(id) = id {
      url
        .query_pairs_mut()
        .append_pair("id", &format!("eq.{}", id));
    }
    Ok(url)
  }

  fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
    let mut request = self
      .client
      .request(method, url)
      .header("Accept", "application/json")
      .header("Prefer", "return=representation");

    if let Some(key) = &self.api_key {
      request = request.header("apikey", key).bearer_auth(key);
    }
    request
  }

  async fn send(
    &self,
    request: reqwest::RequestBuilder,
    table: &str,
    id: &str,
  ) -> Result<Value, ServiceError> {
    let response = request
      .send()
      .await
      .map_err(|e| self.map_transport(e, table))?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(map_status(status, &body, table, id));
    }

    if status == StatusCode::NO_CONTENT {
      return Ok(Value::Null);
    }

    response
      .json()
      .await
      .map_err(|e| ServiceError::decode(table, e.to_string()))
  }

  fn map_transport(&self, error: reqwest::Error, table: &str) -> ServiceError {
    transport_error(TransportFailure::of(&error), error.to_string(), self.timeout, table)
  }
}

/// What went wrong below the HTTP status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportFailure {
  Timeout,
  Connect,
  Decode,
  Other,
}

impl TransportFailure {
  fn of(error: &reqwest::Error) -> Self {
    if error.is_timeout() {
      Self::Timeout
    } else if error.is_connect() || error.is_request() {
      Self::Connect
    } else if error.is_decode() {
      Self::Decode
    } else {
      Self::Other
    }
  }
}

fn transport_error(
  failure: TransportFailure,
  message: String,
  timeout: Duration,
  table: &str,
) -> ServiceError {
  match failure {
    TransportFailure::Timeout => ServiceError::Timeout {
      timeout_ms: timeout.as_millis() as u64,
    },
    TransportFailure::Connect => ServiceError::unavailable(message),
    TransportFailure::Decode => ServiceError::decode(table, message),
    TransportFailure::Other => ServiceError::other(message),
  }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn map_status(status: StatusCode, body: &str, table: &str, id: &str) -> ServiceError {
  match status {
    StatusCode::NOT_FOUND => ServiceError::not_found(table, id),
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::unauthorized(body),
    StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
      ServiceError::validation(body)
    }
    StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ServiceError::unavailable(format!("HTTP {}", status)),
    s if s.is_server_error() => ServiceError::unavailable(format!("HTTP {}: {}", status, body)),
    _ => ServiceError::other(format!("HTTP {}: {}", status, body)),
  }
}

/// First row of a PostgREST array response.
fn first_row(value: Value, table: &str, id: &str) -> Result<Value, ServiceError> {
  match value {
    Value::Array(rows) => rows
      .into_iter()
      .next()
      .ok_or_else(|| ServiceError::not_found(table, id)),
    Value::Object(_) => Ok(value),
    other => Err(ServiceError::decode(
      table,
      format!("expected row array, got {}", other),
    )),
  }
}

#[async_trait]
impl DataService for RestDataService {
  async fn fetch(&self, table: &str, id: &str) -> Result<Value, ServiceError> {
    let url = self.table_url(table, Some(id))?;
    let body = self
      .send(self.request(reqwest::Method::GET, url), table, id)
      .await?;
    first_row(body, table, id)
  }

  async fn write(&self, kind: OperationKind, table: &str, data: &Value) -> Result<Value, ServiceError> {
    match kind {
      OperationKind::Insert => {
        let id = row_id(data).unwrap_or_default();
        let url = self.table_url(table, None)?;
        let body = self
          .send(self.request(reqwest::Method::POST, url).json(data), table, &id)
          .await?;
        first_row(body, table, &id)
      }
      OperationKind::Update => {
        let id = row_id(data)
          .ok_or_else(|| ServiceError::validation(format!("Update on {} without id", table)))?;
        let url = self.table_url(table, Some(&id))?;
        let body = self
          .send(self.request(reqwest::Method::PATCH, url).json(data), table, &id)
          .await?;
        first_row(body, table, &id)
      }
      OperationKind::Delete => {
        let id = row_id(data)
          .ok_or_else(|| ServiceError::validation(format!("Delete on {} without id", table)))?;
        let url = self.table_url(table, Some(&id))?;
        self
          .send(self.request(reqwest::Method::DELETE, url), table, &id)
          .await?;
        Ok(Value::Null)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn service(base: &str) -> RestDataService {
    RestDataService::new(base, None, Duration::from_secs(1)).unwrap()
  }

  #[test]
  fn test_table_url() {
    let svc = service("https://db.example.com/rest/v1");
    assert_eq!(
      svc.table_url("companies", Some("c1")).unwrap().as_str(),
      "https://db.example.com/rest/v1/companies?id=eq.c1"
    );
    assert_eq!(
      svc.table_url("products", None).unwrap().as_str(),
      "https://db.example.com/rest/v1/products"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    let err = RestDataService::new("not a url", None, Duration::from_secs(1)).unwrap_err();
    assert!(err.is_user_facing());
  }

  #[test]
  fn test_status_mapping() {
    assert!(map_status(StatusCode::NOT_FOUND, "", "companies", "c1").is_not_found());
    assert!(map_status(StatusCode::FORBIDDEN, "rls", "companies", "c1").is_user_facing());
    assert!(map_status(StatusCode::UNPROCESSABLE_ENTITY, "bad", "t", "1").is_user_facing());
    assert!(map_status(StatusCode::SERVICE_UNAVAILABLE, "", "t", "1").is_infrastructure());
    assert!(map_status(StatusCode::GATEWAY_TIMEOUT, "", "t", "1").is_infrastructure());
    assert!(!map_status(StatusCode::IM_A_TEAPOT, "", "t", "1").is_infrastructure());
  }

  #[test]
  fn test_first_row() {
    assert_eq!(
      first_row(json!([{"id": "c1"}]), "companies", "c1").unwrap(),
      json!({"id": "c1"})
    );
    assert!(first_row(json!([]), "companies", "c1")
      .unwrap_err()
      .is_not_found());
    assert!(matches!(
      first_row(json!(3), "companies", "c1"),
      Err(ServiceError::Decode { .. })
    ));
  }

  #[test]
  fn test_transport_failures_map_to_taxonomy() {
    let timeout = Duration::from_secs(3);
    let map = |failure| transport_error(failure, "connection refused".into(), timeout, "companies");

    assert_eq!(map(TransportFailure::Timeout), ServiceError::Timeout { timeout_ms: 3000 });
    assert!(map(TransportFailure::Timeout).is_infrastructure());
    assert!(map(TransportFailure::Connect).is_infrastructure());
    assert!(matches!(
      map(TransportFailure::Decode),
      ServiceError::Decode { ref table, .. } if table == "companies"
    ));
    assert!(!map(TransportFailure::Other).is_infrastructure());
  }
}
