use itertools::Either;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single live position sample as delivered by the tracking backend.
///
/// Immutable once received; the most recent one is the vehicle's current
/// position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
  pub latitude: f64,
  pub longitude: f64,
  /// Unix timestamp in seconds.
  pub timestamp: i64,
  #[serde(default)]
  pub speed: f64,
  #[serde(default)]
  pub address: Option<String>,
}

impl TrackPoint {
  /// Position as `[lon, lat]`, the GeoJSON axis order used everywhere else.
  #[must_use]
  pub fn coordinate(&self) -> [f64; 2] {
    [self.longitude, self.latitude]
  }

  /// Address line for display. Reverse geocoding is optional upstream.
  #[must_use]
  pub fn address_or_placeholder(&self) -> &str {
    self.address.as_deref().unwrap_or("Address unavailable")
  }
}

/// Aggregate metrics for the current day's trips.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TripMetrics {
  pub total_distance: f64,
  pub total_time: String,
  pub max_speed: f64,
  pub start_time: String,
  pub end_time: String,
}

/// Load state of the backend's historical dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalStatus {
  pub loaded: bool,
  pub loading: bool,
}

/// Bumped when the historical payload shape changes; invalidates every
/// previously derived cache key.
pub const CACHE_VERSION: u32 = 1;

/// A user's historical-data filter selection. Created per filter action and
/// discarded right after lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQuery {
  pub start_date: chrono::NaiveDate,
  pub end_date: chrono::NaiveDate,
  pub filter_by_boundary: bool,
  pub boundary_id: Option<String>,
}

impl FilterQuery {
  /// Cache identity of this query. Two queries with the same key are
  /// equivalent for caching purposes.
  #[must_use]
  pub fn cache_key(&self) -> String {
    format!(
      "{}:{}:{}:{}:{}",
      CACHE_VERSION,
      self.start_date,
      self.end_date,
      self.filter_by_boundary,
      self.boundary_id.as_deref().unwrap_or("undefined")
    )
  }
}

/// Geometry of a historical route record.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteGeometry {
  LineString(Vec<[f64; 2]>),
  MultiLineString(Vec<Vec<[f64; 2]>>),
}

impl RouteGeometry {
  /// All coordinates regardless of segment structure.
  pub fn coordinates(&self) -> impl Iterator<Item = [f64; 2]> + '_ {
    match self {
      RouteGeometry::LineString(coords) => Either::Left(coords.iter().copied()),
      RouteGeometry::MultiLineString(segments) => {
        Either::Right(segments.iter().flat_map(|s| s.iter().copied()))
      }
    }
  }

  /// Segments with at least two points, the unit of playback.
  #[must_use]
  pub fn playable_segments(&self) -> Vec<&[[f64; 2]]> {
    match self {
      RouteGeometry::LineString(coords) => {
        if coords.len() >= 2 {
          vec![coords.as_slice()]
        } else {
          Vec::new()
        }
      }
      RouteGeometry::MultiLineString(segments) => segments
        .iter()
        .filter(|s| s.len() >= 2)
        .map(Vec::as_slice)
        .collect(),
    }
  }
}

/// One historical driving route. Never mutated in place; filtering always
/// produces a new collection.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteFeature {
  pub geometry: RouteGeometry,
  /// Unix timestamp of the trip's end, when the backend provides one.
  pub timestamp: Option<i64>,
}

impl RouteFeature {
  #[must_use]
  pub fn line_string(coordinates: Vec<[f64; 2]>, timestamp: Option<i64>) -> Self {
    Self {
      geometry: RouteGeometry::LineString(coordinates),
      timestamp,
    }
  }

  #[must_use]
  pub fn multi_line_string(segments: Vec<Vec<[f64; 2]>>, timestamp: Option<i64>) -> Self {
    Self {
      geometry: RouteGeometry::MultiLineString(segments),
      timestamp,
    }
  }

  #[must_use]
  pub fn bounding_box(&self) -> LonLatBounds {
    LonLatBounds::from_coordinates(self.geometry.coordinates())
  }
}

/// A set of historical routes, the unit passed between the loader, the
/// spatial filter and the map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureCollection {
  pub features: Vec<RouteFeature>,
}

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
  #[error("payload is not a GeoJSON FeatureCollection")]
  NotAFeatureCollection,
  #[error("FeatureCollection has no 'features' array")]
  MissingFeatures,
}

impl FeatureCollection {
  #[must_use]
  pub fn new(features: Vec<RouteFeature>) -> Self {
    Self { features }
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.features.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.features.len()
  }

  /// Parses a GeoJSON `FeatureCollection` value.
  ///
  /// Features that are not LineString/MultiLineString or are otherwise
  /// malformed are skipped with a warning; an empty `features` array is a
  /// valid, empty collection.
  pub fn from_value(value: &Value) -> Result<Self, ModelError> {
    let obj = value
      .as_object()
      .ok_or(ModelError::NotAFeatureCollection)?;
    if obj.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
      return Err(ModelError::NotAFeatureCollection);
    }
    let features = obj
      .get("features")
      .and_then(Value::as_array)
      .ok_or(ModelError::MissingFeatures)?;

    let parsed = features
      .iter()
      .filter_map(|feature| {
        let route = parse_feature(feature);
        if route.is_none() {
          log::warn!("Skipping malformed route feature: {feature}");
        }
        route
      })
      .collect();
    Ok(Self { features: parsed })
  }

  /// GeoJSON representation, for handing a collection back to a map layer.
  #[must_use]
  pub fn to_value(&self) -> Value {
    let features: Vec<Value> = self.features.iter().map(feature_to_value).collect();
    serde_json::json!({ "type": "FeatureCollection", "features": features })
  }

  #[must_use]
  pub fn bounding_box(&self) -> LonLatBounds {
    self
      .features
      .iter()
      .map(RouteFeature::bounding_box)
      .fold(LonLatBounds::default(), |acc, b| acc.extend(&b))
  }
}

fn parse_feature(feature: &Value) -> Option<RouteFeature> {
  let obj = feature.as_object()?;
  let geometry = obj.get("geometry")?.as_object()?;
  let coordinates = geometry.get("coordinates")?;
  let timestamp = obj
    .get("properties")
    .and_then(|p| p.get("timestamp"))
    .and_then(Value::as_i64);

  match geometry.get("type")?.as_str()? {
    "LineString" => {
      let coords = parse_coordinate_array(coordinates)?;
      (coords.len() >= 2).then(|| RouteFeature::line_string(coords, timestamp))
    }
    "MultiLineString" => {
      let segments: Vec<Vec<[f64; 2]>> = coordinates
        .as_array()?
        .iter()
        .filter_map(parse_coordinate_array)
        .filter(|s| s.len() >= 2)
        .collect();
      (!segments.is_empty()).then(|| RouteFeature::multi_line_string(segments, timestamp))
    }
    _ => None,
  }
}

/// Parses `[[lon, lat], ...]`; extra elements per position (elevation) are
/// ignored.
fn parse_coordinate_array(coords: &Value) -> Option<Vec<[f64; 2]>> {
  Some(
    coords
      .as_array()?
      .iter()
      .filter_map(parse_coordinate)
      .collect(),
  )
}

fn parse_coordinate(coord: &Value) -> Option<[f64; 2]> {
  let array = coord.as_array()?;
  if array.len() < 2 {
    return None;
  }
  Some([array[0].as_f64()?, array[1].as_f64()?])
}

fn feature_to_value(feature: &RouteFeature) -> Value {
  let (geom_type, coordinates) = match &feature.geometry {
    RouteGeometry::LineString(coords) => ("LineString", serde_json::json!(coords)),
    RouteGeometry::MultiLineString(segments) => ("MultiLineString", serde_json::json!(segments)),
  };
  serde_json::json!({
    "type": "Feature",
    "geometry": { "type": geom_type, "coordinates": coordinates },
    "properties": { "timestamp": feature.timestamp },
  })
}

/// An axis-aligned `[minLon, minLat, maxLon, maxLat]` rectangle used for
/// cheap spatial culling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LonLatBounds {
  pub min_lon: f64,
  pub min_lat: f64,
  pub max_lon: f64,
  pub max_lat: f64,
}

impl Default for LonLatBounds {
  fn default() -> Self {
    Self::get_invalid()
  }
}

impl LonLatBounds {
  #[must_use]
  pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
    Self {
      min_lon,
      min_lat,
      max_lon,
      max_lat,
    }
  }

  #[must_use]
  pub fn get_invalid() -> Self {
    Self {
      min_lon: f64::MAX,
      min_lat: f64::MAX,
      max_lon: f64::MIN,
      max_lat: f64::MIN,
    }
  }

  #[must_use]
  pub fn is_valid(&self) -> bool {
    self.min_lon <= self.max_lon && self.min_lat <= self.max_lat
  }

  pub fn add_coordinate(&mut self, coord: [f64; 2]) {
    self.min_lon = self.min_lon.min(coord[0]);
    self.min_lat = self.min_lat.min(coord[1]);
    self.max_lon = self.max_lon.max(coord[0]);
    self.max_lat = self.max_lat.max(coord[1]);
  }

  pub fn from_coordinates<I: IntoIterator<Item = [f64; 2]>>(coords: I) -> Self {
    let mut bounds = Self::get_invalid();
    coords
      .into_iter()
      .for_each(|c| bounds.add_coordinate(c));
    bounds
  }

  #[must_use]
  pub fn extend(self, other: &Self) -> Self {
    if !self.is_valid() {
      return *other;
    }
    if !other.is_valid() {
      return self;
    }
    Self {
      min_lon: self.min_lon.min(other.min_lon),
      min_lat: self.min_lat.min(other.min_lat),
      max_lon: self.max_lon.max(other.max_lon),
      max_lat: self.max_lat.max(other.max_lat),
    }
  }

  #[must_use]
  pub fn contains(&self, coord: [f64; 2]) -> bool {
    coord[0] >= self.min_lon
      && coord[0] <= self.max_lon
      && coord[1] >= self.min_lat
      && coord[1] <= self.max_lat
  }
}
