//! Live position tracking.
//!
//! Two background pollers feed this module: a fast one for the latest raw
//! sample and a slower one for the enriched live feed plus trip metrics.
//! Both funnel into [`LiveTracker::on_point`], which owns the live-route
//! layer; whichever poller lands last wins, and consecutive duplicates of
//! the same coordinate are dropped so the polyline never stutters in place.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;

use crate::api::TrackerApi;
use crate::engine::notify::NoticeQueue;
use crate::map_view::{LayerId, MapView};
use crate::model::{FeatureCollection, TrackPoint, TripMetrics};

/// Wait applied after a failed poll before the next attempt.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

struct LiveState {
  last_coordinate: Option<[f64; 2]>,
}

/// Owns the live-route layer. Clones share state.
#[derive(Clone)]
pub struct LiveTracker {
  view: Arc<dyn MapView>,
  state: Arc<Mutex<LiveState>>,
}

impl LiveTracker {
  #[must_use]
  pub fn new(view: Arc<dyn MapView>) -> Self {
    Self {
      view,
      state: Arc::new(Mutex::new(LiveState {
        last_coordinate: None,
      })),
    }
  }

  /// Applies one live sample: moves the marker and extends the polyline.
  /// A sample at the exact coordinate of the previous one is a no-op.
  /// Returns whether the sample was applied.
  pub fn on_point(&self, point: &TrackPoint) -> bool {
    let coordinate = point.coordinate();
    let mut state = self.state.lock().unwrap();
    if state.last_coordinate == Some(coordinate) {
      debug!("live sample unchanged, skipping");
      return false;
    }
    self.view.set_marker(LayerId::LiveRoute, coordinate);
    self.view.append_polyline_point(LayerId::LiveRoute, coordinate);
    state.last_coordinate = Some(coordinate);
    debug!(
      "live position {coordinate:?} ({})",
      point.address_or_placeholder()
    );
    true
  }

  /// Replays a persisted route onto the live layer, so a fresh session
  /// starts where the previous one left off.
  pub fn seed_from_route(&self, route: &FeatureCollection) {
    let mut state = self.state.lock().unwrap();
    let mut last = None;
    for feature in &route.features {
      for coordinate in feature.geometry.coordinates() {
        self.view.append_polyline_point(LayerId::LiveRoute, coordinate);
        last = Some(coordinate);
      }
    }
    if let Some(coordinate) = last {
      self.view.set_marker(LayerId::LiveRoute, coordinate);
      state.last_coordinate = Some(coordinate);
    }
  }

  /// Removes the live route from the map and forgets the dedup state.
  pub fn clear(&self) {
    let mut state = self.state.lock().unwrap();
    state.last_coordinate = None;
    self.view.clear_layer(LayerId::LiveRoute);
  }

  #[must_use]
  pub fn last_coordinate(&self) -> Option<[f64; 2]> {
    self.state.lock().unwrap().last_coordinate
  }
}

/// Latest trip metrics, published by the slow poller.
#[derive(Default)]
pub struct MetricsBoard {
  latest: Mutex<Option<TripMetrics>>,
}

impl MetricsBoard {
  pub fn publish(&self, metrics: TripMetrics) {
    *self.latest.lock().unwrap() = Some(metrics);
  }

  #[must_use]
  pub fn latest(&self) -> Option<TripMetrics> {
    self.latest.lock().unwrap().clone()
  }
}

/// Handles for the two poller tasks; dropping them stops the polling.
pub struct PollerHandles {
  fast: JoinHandle<()>,
  slow: JoinHandle<()>,
}

impl Drop for PollerHandles {
  fn drop(&mut self) {
    self.fast.abort();
    self.slow.abort();
  }
}

/// Spawns the fast (raw position) and slow (live feed + metrics) pollers.
/// A poll failure raises one warning notice and retries after a fixed
/// backoff; repeat failures only log until the endpoint recovers, so a dead
/// backend does not stack a notice per cycle.
pub fn spawn_pollers(
  api: Arc<dyn TrackerApi>,
  tracker: LiveTracker,
  board: Arc<MetricsBoard>,
  notices: NoticeQueue,
  fast_interval: Duration,
  slow_interval: Duration,
) -> PollerHandles {
  let fast = {
    let api = api.clone();
    let tracker = tracker.clone();
    let notices = notices.clone();
    tokio::spawn(async move {
      let mut reported = false;
      loop {
        match api.latest_raw().await {
          Ok(point) => {
            reported = false;
            if let Some(point) = point {
              tracker.on_point(&point);
            }
          }
          Err(e) => {
            if !reported {
              notices.warning(format!("Live position poll failed: {e}"));
              reported = true;
            } else {
              warn!("latest position poll still failing: {e}");
            }
            tokio::time::sleep(ERROR_BACKOFF).await;
          }
        }
        tokio::time::sleep(fast_interval).await;
      }
    })
  };

  let slow = tokio::spawn(async move {
    let mut live_reported = false;
    let mut metrics_reported = false;
    loop {
      match api.live_data().await {
        Ok(point) => {
          live_reported = false;
          if let Some(point) = point {
            tracker.on_point(&point);
          }
        }
        Err(e) => {
          if !live_reported {
            notices.warning(format!("Live data poll failed: {e}"));
            live_reported = true;
          } else {
            warn!("live data poll still failing: {e}");
          }
          tokio::time::sleep(ERROR_BACKOFF).await;
        }
      }
      match api.trip_metrics().await {
        Ok(metrics) => {
          metrics_reported = false;
          board.publish(metrics);
        }
        Err(e) => {
          if !metrics_reported {
            notices.warning(format!("Trip metrics poll failed: {e}"));
            metrics_reported = true;
          } else {
            warn!("trip metrics poll still failing: {e}");
          }
        }
      }
      tokio::time::sleep(slow_interval).await;
    }
  });

  PollerHandles { fast, slow }
}
