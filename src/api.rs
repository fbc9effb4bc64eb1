//! HTTP client for the tracking backend.
//!
//! The backend is consumed purely through its request/response contracts;
//! everything here converts wire payloads into `model` types and maps
//! failures into [`ApiError`].

use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use surf::http::Method;
use surf::{Request, Url};
use thiserror::Error;

use crate::model::{FeatureCollection, FilterQuery, HistoricalStatus, TrackPoint, TripMetrics};

#[derive(Error, Debug)]
pub enum ApiError {
  #[error("request failed: {0}")]
  Request(String),
  #[error("unexpected HTTP status {status}")]
  Status { status: u16 },
  #[error("failed to decode response: {0}")]
  Decode(String),
  #[error("backend error: {0}")]
  Backend(String),
}

/// The backend contract (spec'd endpoints only; the server itself is an
/// external collaborator).
#[async_trait]
pub trait TrackerApi: Send + Sync {
  /// `GET /historical_data` — the route collection for a filter selection.
  async fn historical_data(&self, query: &FilterQuery) -> Result<FeatureCollection, ApiError>;

  /// `GET /historical_data_status`
  async fn historical_data_status(&self) -> Result<HistoricalStatus, ApiError>;

  /// `GET /live_data` — live position plus a server-side polyline append.
  /// `Ok(None)` means "no live data right now", not a failure.
  async fn live_data(&self) -> Result<Option<TrackPoint>, ApiError>;

  /// `GET /latest_bouncie_data` — latest raw sample, cheaper than
  /// `live_data`, polled at the fast interval.
  async fn latest_raw(&self) -> Result<Option<TrackPoint>, ApiError>;

  /// `GET /live_route` — the persisted live route, for seeding after a
  /// reload.
  async fn live_route(&self) -> Result<FeatureCollection, ApiError>;

  /// `GET /trip_metrics`
  async fn trip_metrics(&self) -> Result<TripMetrics, ApiError>;

  /// `GET /export_gpx` — opaque GPX bytes, downloaded, never parsed.
  async fn export_gpx(&self, query: &FilterQuery) -> Result<Vec<u8>, ApiError>;

  /// `POST /update_historical_data` — asks the backend to refetch trips.
  async fn update_historical_data(&self) -> Result<String, ApiError>;

  /// `POST /update_progress`
  async fn update_progress(&self) -> Result<String, ApiError>;

  /// `GET /processing_status` — whether the backend is mid-update.
  async fn processing_status(&self) -> Result<bool, ApiError>;
}

/// `TrackerApi` over HTTP via surf.
pub struct HttpTrackerApi {
  base_url: String,
  client: surf::Client,
}

impl HttpTrackerApi {
  #[must_use]
  pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
    let client: surf::Client = surf::Config::new()
      .set_timeout(Some(timeout))
      .try_into()
      .expect("client");
    Self {
      base_url: base_url.into().trim_end_matches('/').to_string(),
      client,
    }
  }

  fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, ApiError> {
    let mut url = format!("{}{path}", self.base_url);
    for (i, (key, value)) in query.iter().enumerate() {
      let sep = if i == 0 { '?' } else { '&' };
      url.push(sep);
      url.push_str(key);
      url.push('=');
      url.push_str(&urlencoding::encode(value));
    }
    Url::parse(&url).map_err(|e| ApiError::Request(e.to_string()))
  }

  async fn fetch(&self, method: Method, url: Url) -> Result<Vec<u8>, ApiError> {
    let request = Request::new(method, url);
    let mut response = self
      .client
      .send(request)
      .await
      .map_err(|e| ApiError::Request(e.to_string()))?;
    let status = response.status();
    let bytes = response
      .body_bytes()
      .await
      .map_err(|e| ApiError::Request(e.to_string()))?;
    if !status.is_success() {
      // Error bodies carry `{ "error": ... }` when the backend had a say.
      if let Ok(value) = serde_json::from_slice::<Value>(&bytes)
        && let Some(message) = value.get("error").and_then(Value::as_str)
      {
        return Err(ApiError::Backend(message.to_string()));
      }
      return Err(ApiError::Status {
        status: status.into(),
      });
    }
    inflate_if_compressed(&bytes)
  }

  async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
    let bytes = self.fetch(Method::Get, self.url(path, query)?).await?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
  }

  async fn post_message(&self, path: &str) -> Result<String, ApiError> {
    let bytes = self.fetch(Method::Post, self.url(path, &[])?).await?;
    let value: Value =
      serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))?;
    if let Some(message) = value.get("error").and_then(Value::as_str) {
      return Err(ApiError::Backend(message.to_string()));
    }
    Ok(
      value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string(),
    )
  }

  fn date_query(query: &FilterQuery) -> Vec<(&'static str, String)> {
    vec![
      ("startDate", query.start_date.to_string()),
      ("endDate", query.end_date.to_string()),
      ("filterWaco", query.filter_by_boundary.to_string()),
      (
        "wacoBoundary",
        query.boundary_id.clone().unwrap_or_else(|| "none".to_string()),
      ),
    ]
  }
}

#[async_trait]
impl TrackerApi for HttpTrackerApi {
  async fn historical_data(&self, query: &FilterQuery) -> Result<FeatureCollection, ApiError> {
    let value = self
      .get_json("/historical_data", &Self::date_query(query))
      .await?;
    FeatureCollection::from_value(&value).map_err(|e| ApiError::Decode(e.to_string()))
  }

  async fn historical_data_status(&self) -> Result<HistoricalStatus, ApiError> {
    let value = self.get_json("/historical_data_status", &[]).await?;
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
  }

  async fn live_data(&self) -> Result<Option<TrackPoint>, ApiError> {
    let value = self.get_json("/live_data", &[]).await?;
    track_point_from_value(value)
  }

  async fn latest_raw(&self) -> Result<Option<TrackPoint>, ApiError> {
    let value = self.get_json("/latest_bouncie_data", &[]).await?;
    track_point_from_value(value)
  }

  async fn live_route(&self) -> Result<FeatureCollection, ApiError> {
    let value = self.get_json("/live_route", &[]).await?;
    FeatureCollection::from_value(&value).map_err(|e| ApiError::Decode(e.to_string()))
  }

  async fn trip_metrics(&self) -> Result<TripMetrics, ApiError> {
    let value = self.get_json("/trip_metrics", &[]).await?;
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
  }

  async fn export_gpx(&self, query: &FilterQuery) -> Result<Vec<u8>, ApiError> {
    self
      .fetch(
        Method::Get,
        self.url("/export_gpx", &Self::date_query(query))?,
      )
      .await
  }

  async fn update_historical_data(&self) -> Result<String, ApiError> {
    self.post_message("/update_historical_data").await
  }

  async fn update_progress(&self) -> Result<String, ApiError> {
    self.post_message("/update_progress").await
  }

  async fn processing_status(&self) -> Result<bool, ApiError> {
    let value = self.get_json("/processing_status", &[]).await?;
    value
      .get("isProcessing")
      .and_then(Value::as_bool)
      .ok_or_else(|| ApiError::Decode("missing isProcessing".to_string()))
  }
}

/// Single-point endpoints answer either a `TrackPoint` object or
/// `{ "error": ... }`; the latter is a valid "nothing to show" response.
fn track_point_from_value(value: Value) -> Result<Option<TrackPoint>, ApiError> {
  if value.get("error").is_some() || value.as_object().is_none_or(serde_json::Map::is_empty) {
    return Ok(None);
  }
  serde_json::from_value(value)
    .map(Some)
    .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Historical payloads may arrive gzip- or zlib-compressed. Sniffs the magic
/// bytes and inflates before JSON parsing; anything else passes through.
fn inflate_if_compressed(bytes: &[u8]) -> Result<Vec<u8>, ApiError> {
  match bytes {
    [0x1f, 0x8b, ..] => {
      let mut inflated = Vec::new();
      flate2::read::GzDecoder::new(bytes)
        .read_to_end(&mut inflated)
        .map_err(|e| ApiError::Decode(format!("gzip: {e}")))?;
      Ok(inflated)
    }
    [0x78, 0x01 | 0x9c | 0xda, ..] => {
      let mut inflated = Vec::new();
      flate2::read::ZlibDecoder::new(bytes)
        .read_to_end(&mut inflated)
        .map_err(|e| ApiError::Decode(format!("zlib: {e}")))?;
      Ok(inflated)
    }
    _ => Ok(bytes.to_vec()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flate2::Compression;
  use flate2::write::{GzEncoder, ZlibEncoder};
  use serde_json::json;
  use std::io::Write;

  const PAYLOAD: &[u8] = br#"{"type":"FeatureCollection","features":[]}"#;

  #[test]
  fn gzip_payload_is_inflated() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(PAYLOAD).unwrap();
    let compressed = encoder.finish().unwrap();

    assert_eq!(inflate_if_compressed(&compressed).unwrap(), PAYLOAD);
  }

  #[test]
  fn zlib_payload_is_inflated() {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(PAYLOAD).unwrap();
    let compressed = encoder.finish().unwrap();

    assert_eq!(inflate_if_compressed(&compressed).unwrap(), PAYLOAD);
  }

  #[test]
  fn plain_payload_passes_through() {
    assert_eq!(inflate_if_compressed(PAYLOAD).unwrap(), PAYLOAD);
  }

  #[test]
  fn error_object_means_no_live_data() {
    let value = json!({ "error": "No live data available" });
    assert_eq!(track_point_from_value(value).unwrap(), None);
  }

  #[test]
  fn empty_object_means_no_live_data() {
    assert_eq!(track_point_from_value(json!({})).unwrap(), None);
  }

  #[test]
  fn track_point_object_is_decoded() {
    let value = json!({
      "latitude": 31.55,
      "longitude": -97.14,
      "timestamp": 1_706_000_000,
      "speed": 38.0,
      "address": "900 Austin Ave"
    });
    let point = track_point_from_value(value).unwrap().unwrap();
    assert_eq!(point.coordinate(), [-97.14, 31.55]);
    assert_eq!(point.address.as_deref(), Some("900 Austin Ave"));
  }

  #[test]
  fn malformed_track_point_is_a_decode_error() {
    let value = json!({ "latitude": "not a number" });
    assert!(matches!(
      track_point_from_value(value),
      Err(ApiError::Decode(_))
    ));
  }

  #[test]
  fn query_string_is_built_from_the_filter() {
    let api = HttpTrackerApi::new("http://localhost:8080/", Duration::from_secs(5));
    let query = FilterQuery {
      start_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
      end_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
      filter_by_boundary: true,
      boundary_id: Some("city_limits".to_string()),
    };
    let url = api
      .url("/historical_data", &HttpTrackerApi::date_query(&query))
      .unwrap();
    assert_eq!(
      url.as_str(),
      "http://localhost:8080/historical_data?startDate=2024-01-01&endDate=2024-01-31&filterWaco=true&wacoBoundary=city_limits"
    );
  }
}
