//! The seam between the engine and whatever actually draws the map.
//!
//! The engine never touches rendering directly; it issues layer operations
//! through [`MapView`] so the whole state machine can be exercised without a
//! map widget.

use std::sync::Mutex;

use crate::model::{FeatureCollection, LonLatBounds};

/// The map layers the engine writes to. Ownership is disjoint: the live
/// tracker only writes `LiveRoute`, playback only writes `Playback`, and the
/// historical pipeline only writes `Historical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerId {
  Historical,
  LiveRoute,
  Playback,
}

/// Rendering operations the engine needs from its host.
pub trait MapView: Send + Sync {
  /// Replaces the layer's content wholesale.
  fn add_layer(&self, layer: LayerId, features: &FeatureCollection);
  fn remove_layer(&self, layer: LayerId);
  /// Moves (or creates) the layer's single marker.
  fn set_marker(&self, layer: LayerId, position: [f64; 2]);
  /// Appends one point to the layer's polyline.
  fn append_polyline_point(&self, layer: LayerId, position: [f64; 2]);
  /// Removes the layer's marker and polyline.
  fn clear_layer(&self, layer: LayerId);
  fn fit_bounds(&self, bounds: LonLatBounds);
  /// Current viewport, if the host has one. `None` means "show everything".
  fn viewport(&self) -> Option<LonLatBounds> {
    None
  }
}

/// Everything a [`RecordingView`] has seen, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewOp {
  AddLayer(LayerId, usize),
  RemoveLayer(LayerId),
  SetMarker(LayerId, [f64; 2]),
  AppendPolylinePoint(LayerId, [f64; 2]),
  ClearLayer(LayerId),
  FitBounds(LonLatBounds),
}

/// A `MapView` that records operations instead of drawing. Used by the test
/// suites; hosts embed their own implementation.
#[derive(Debug, Default)]
pub struct RecordingView {
  ops: Mutex<Vec<ViewOp>>,
  viewport: Mutex<Option<LonLatBounds>>,
}

impl RecordingView {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_viewport(&self, bounds: Option<LonLatBounds>) {
    *self.viewport.lock().unwrap() = bounds;
  }

  /// Snapshot of all recorded operations.
  #[must_use]
  pub fn ops(&self) -> Vec<ViewOp> {
    self.ops.lock().unwrap().clone()
  }

  /// Points appended to the given layer's polyline, in order.
  #[must_use]
  pub fn polyline_points(&self, layer: LayerId) -> Vec<[f64; 2]> {
    self
      .ops
      .lock()
      .unwrap()
      .iter()
      .filter_map(|op| match op {
        ViewOp::AppendPolylinePoint(l, p) if *l == layer => Some(*p),
        _ => None,
      })
      .collect()
  }

  #[must_use]
  pub fn last_marker(&self, layer: LayerId) -> Option<[f64; 2]> {
    self
      .ops
      .lock()
      .unwrap()
      .iter()
      .rev()
      .find_map(|op| match op {
        ViewOp::SetMarker(l, p) if *l == layer => Some(*p),
        _ => None,
      })
  }

  fn record(&self, op: ViewOp) {
    self.ops.lock().unwrap().push(op);
  }
}

impl MapView for RecordingView {
  fn add_layer(&self, layer: LayerId, features: &FeatureCollection) {
    self.record(ViewOp::AddLayer(layer, features.len()));
  }

  fn remove_layer(&self, layer: LayerId) {
    self.record(ViewOp::RemoveLayer(layer));
  }

  fn set_marker(&self, layer: LayerId, position: [f64; 2]) {
    self.record(ViewOp::SetMarker(layer, position));
  }

  fn append_polyline_point(&self, layer: LayerId, position: [f64; 2]) {
    self.record(ViewOp::AppendPolylinePoint(layer, position));
  }

  fn clear_layer(&self, layer: LayerId) {
    self.record(ViewOp::ClearLayer(layer));
  }

  fn fit_bounds(&self, bounds: LonLatBounds) {
    self.record(ViewOp::FitBounds(bounds));
  }

  fn viewport(&self) -> Option<LonLatBounds> {
    *self.viewport.lock().unwrap()
  }
}
