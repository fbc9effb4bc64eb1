//! Spatial filtering of route collections.
//!
//! Two predicate families: a cheap bounding-box cull used for viewport
//! filtering, and a proper polygon containment/crossing test used for the
//! user-drawn-shape feature. The bounding-box variant runs on a dedicated
//! worker thread so big collections never stall the caller; the polygon
//! variant is called on the already-rendered layer only, which is small.

use std::sync::mpsc;
use std::thread;

use geo::{Contains, Intersects};
use geo_types::{Coord, LineString, Polygon};
use rayon::prelude::*;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::model::{FeatureCollection, LonLatBounds, RouteFeature, RouteGeometry};

/// A feature passes if any of its coordinates falls within `bounds`. For
/// MultiLineString, any point of any segment qualifies.
#[must_use]
pub fn bounds_filter(features: &FeatureCollection, bounds: &LonLatBounds) -> FeatureCollection {
  let passing = features
    .features
    .par_iter()
    .filter(|feature| feature.geometry.coordinates().any(|c| bounds.contains(c)))
    .cloned()
    .collect();
  FeatureCollection::new(passing)
}

/// Builds the filter polygon from a drawn ring of `[lon, lat]` vertices.
/// Returns `None` for degenerate rings (fewer than three vertices).
#[must_use]
pub fn polygon_from_ring(ring: &[[f64; 2]]) -> Option<Polygon<f64>> {
  if ring.len() < 3 {
    return None;
  }
  let exterior: LineString<f64> = ring
    .iter()
    .map(|c| Coord { x: c[0], y: c[1] })
    .collect();
  Some(Polygon::new(exterior, Vec::new()))
}

/// A LineString passes if it crosses the polygon boundary or lies fully
/// within it; for MultiLineString any qualifying segment is sufficient.
#[must_use]
pub fn polygon_filter(features: &FeatureCollection, polygon: &Polygon<f64>) -> FeatureCollection {
  let passing = features
    .features
    .iter()
    .filter(|feature| feature_matches_polygon(feature, polygon))
    .cloned()
    .collect();
  FeatureCollection::new(passing)
}

fn feature_matches_polygon(feature: &RouteFeature, polygon: &Polygon<f64>) -> bool {
  match &feature.geometry {
    RouteGeometry::LineString(coords) => segment_matches_polygon(coords, polygon),
    RouteGeometry::MultiLineString(segments) => segments
      .iter()
      .any(|segment| segment_matches_polygon(segment, polygon)),
  }
}

fn segment_matches_polygon(coords: &[[f64; 2]], polygon: &Polygon<f64>) -> bool {
  let line: LineString<f64> = coords
    .iter()
    .map(|c| Coord { x: c[0], y: c[1] })
    .collect();
  polygon.contains(&line) || polygon.intersects(&line)
}

#[derive(Error, Debug)]
pub enum WorkerError {
  #[error("filter worker is gone")]
  WorkerGone,
}

/// Request to the filter worker. Tagged union rather than a stringly
/// message; the reply channel closes if the worker dies, which callers turn
/// into a main-thread fallback.
pub enum FilterRequest {
  BoundingBox {
    features: FeatureCollection,
    bounds: LonLatBounds,
    reply: oneshot::Sender<FilterResponse>,
  },
}

pub enum FilterResponse {
  Filtered(FeatureCollection),
}

/// Owns the dedicated filtering thread. Dropping the worker closes the
/// request channel and lets the thread exit.
pub struct FilterWorker {
  tx: mpsc::Sender<FilterRequest>,
}

impl FilterWorker {
  #[must_use]
  pub fn spawn() -> Self {
    let (tx, rx) = mpsc::channel::<FilterRequest>();
    let builder = thread::Builder::new().name("filter-worker".to_string());
    let spawned = builder.spawn(move || {
      while let Ok(request) = rx.recv() {
        match request {
          FilterRequest::BoundingBox {
            features,
            bounds,
            reply,
          } => {
            let filtered = bounds_filter(&features, &bounds);
            // Receiver may have given up; nothing to do then.
            let _ = reply.send(FilterResponse::Filtered(filtered));
          }
        }
      }
      log::debug!("filter worker shutting down");
    });
    if let Err(e) = spawned {
      log::error!("Failed to spawn filter worker: {e}");
    }
    Self { tx }
  }

  /// Bounding-box cull on the worker thread.
  pub async fn filter_by_bounds(
    &self,
    features: FeatureCollection,
    bounds: LonLatBounds,
  ) -> Result<FeatureCollection, WorkerError> {
    let (reply, response) = oneshot::channel();
    self
      .tx
      .send(FilterRequest::BoundingBox {
        features,
        bounds,
        reply,
      })
      .map_err(|_| WorkerError::WorkerGone)?;
    match response.await {
      Ok(FilterResponse::Filtered(filtered)) => Ok(filtered),
      Err(_) => Err(WorkerError::WorkerGone),
    }
  }
}
