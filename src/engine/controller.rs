//! The engine itself: owns every component and turns host intents into
//! serialized pipeline work.
//!
//! Hosts construct an [`Engine`], call [`Engine::startup`] once a runtime is
//! available, and afterwards feed it [`Intent`]s. All map mutation flows
//! through here; the host only reads back notices, busy state and metrics.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use log::{debug, warn};

use crate::api::TrackerApi;
use crate::config::Config;
use crate::engine::historical::HistoricalLoader;
use crate::engine::live::{LiveTracker, MetricsBoard, PollerHandles, spawn_pollers};
use crate::engine::notify::NoticeQueue;
use crate::engine::playback::{Playback, PlaybackPhase};
use crate::engine::serializer::{BusyPolicy, TaskOutcome, TaskSerializer};
use crate::engine::spatial::{FilterWorker, WorkerError, bounds_filter, polygon_from_ring, polygon_filter};
use crate::map_view::{LayerId, MapView};
use crate::model::{FeatureCollection, FilterQuery, RouteGeometry, TripMetrics};

/// Everything a host can ask the engine to do.
#[derive(Debug, Clone)]
pub enum Intent {
  /// Load (or re-display) historical routes for a filter selection.
  LoadHistorical(FilterQuery),
  /// Re-cull the loaded routes against the current viewport.
  FilterToViewport,
  /// Restrict the rendered routes to a user-drawn polygon.
  ApplyPolygonFilter(Vec<[f64; 2]>),
  /// Replay the given route geometry on the playback layer.
  StartPlayback(RouteGeometry),
  TogglePlayPause,
  StopPlayback,
  AdjustPlaybackSpeed(f64),
  ClearLiveRoute,
  /// Download the GPX export for a filter selection.
  ExportGpx(FilterQuery),
  /// Ask the backend to refetch trip data, then wait until it is ready.
  UpdateHistoricalData,
}

/// Busy policies, fixed per intent:
///
/// * `Enqueue`: `LoadHistorical`, `ExportGpx` — user-driven requests that
///   should run eventually, in order.
/// * `Reject`: `FilterToViewport` (a newer viewport supersedes it anyway)
///   and `UpdateHistoricalData` (the backend refuses concurrent updates).
///
/// Playback, polygon filtering and live-route intents never touch the
/// serializer: they operate on already-rendered state on the calling task.
#[derive(Clone)]
pub struct Engine {
  api: Arc<dyn TrackerApi>,
  view: Arc<dyn MapView>,
  notices: NoticeQueue,
  serializer: TaskSerializer,
  loader: Arc<HistoricalLoader>,
  worker: Arc<FilterWorker>,
  playback: Playback,
  live: LiveTracker,
  metrics: Arc<MetricsBoard>,
  /// Last loaded, unculled collection; viewport filtering re-culls this.
  loaded: Arc<Mutex<FeatureCollection>>,
  /// What is currently on the historical layer.
  rendered: Arc<Mutex<FeatureCollection>>,
  gpx_export: Arc<Mutex<Option<Vec<u8>>>>,
  pollers: Arc<Mutex<Option<PollerHandles>>>,
  config: Arc<Config>,
}

impl Engine {
  #[must_use]
  pub fn new(api: Arc<dyn TrackerApi>, view: Arc<dyn MapView>, config: Config) -> Self {
    let notices = NoticeQueue::new();
    Self {
      loader: Arc::new(HistoricalLoader::new(
        api.clone(),
        config.resolved_cache_capacity(),
      )),
      serializer: TaskSerializer::new(notices.clone()),
      worker: Arc::new(FilterWorker::spawn()),
      playback: Playback::new(view.clone(), config.playback_tick()),
      live: LiveTracker::new(view.clone()),
      metrics: Arc::new(MetricsBoard::default()),
      loaded: Arc::default(),
      rendered: Arc::default(),
      gpx_export: Arc::default(),
      pollers: Arc::default(),
      config: Arc::new(config),
      notices,
      api,
      view,
    }
  }

  /// One-time startup: checks whether the backend is mid-update (and locks
  /// the serializer until it finishes), restores the persisted live route,
  /// and starts the live pollers. Requires a tokio runtime.
  pub async fn startup(&self) {
    match self.api.processing_status().await {
      Ok(true) => {
        let this = self.clone();
        let serializer = self.serializer.clone();
        tokio::spawn(async move {
          serializer
            .run_exclusive(
              "Processing historical data...",
              BusyPolicy::Enqueue,
              async move { this.await_historical_ready().await },
            )
            .await
        });
      }
      Ok(false) => {}
      Err(e) => self
        .notices
        .warning(format!("Processing status check failed: {e}")),
    }

    match self.api.live_route().await {
      Ok(route) => self.live.seed_from_route(&route),
      Err(e) => self
        .notices
        .warning(format!("Could not restore the live route: {e}")),
    }

    let handles = spawn_pollers(
      self.api.clone(),
      self.live.clone(),
      self.metrics.clone(),
      self.notices.clone(),
      self.config.live_poll_interval(),
      self.config.metrics_poll_interval(),
    );
    *self.pollers.lock().unwrap() = Some(handles);
  }

  /// Executes one intent. The returned outcome refers to this intent only;
  /// errors are surfaced through the notice queue, not the return value.
  pub async fn dispatch(&self, intent: Intent) -> TaskOutcome {
    match intent {
      Intent::LoadHistorical(query) => {
        let this = self.clone();
        self
          .serializer
          .run_exclusive("Loading historical data...", BusyPolicy::Enqueue, async move {
            this.load_historical(query).await
          })
          .await
      }
      Intent::FilterToViewport => {
        let this = self.clone();
        self
          .serializer
          .run_exclusive("Filtering routes...", BusyPolicy::Reject, async move {
            this.filter_to_viewport().await
          })
          .await
      }
      Intent::ExportGpx(query) => {
        let this = self.clone();
        self
          .serializer
          .run_exclusive("Exporting GPX...", BusyPolicy::Enqueue, async move {
            this.export_gpx(query).await
          })
          .await
      }
      Intent::UpdateHistoricalData => {
        let this = self.clone();
        self
          .serializer
          .run_exclusive(
            "Updating historical data...",
            BusyPolicy::Reject,
            async move { this.update_historical_data().await },
          )
          .await
      }
      Intent::ApplyPolygonFilter(ring) => {
        self.apply_polygon_filter(&ring);
        TaskOutcome::Completed
      }
      Intent::StartPlayback(geometry) => {
        self.start_playback(&geometry);
        TaskOutcome::Completed
      }
      Intent::TogglePlayPause => {
        self.playback.toggle_play_pause();
        TaskOutcome::Completed
      }
      Intent::StopPlayback => {
        self.playback.stop();
        TaskOutcome::Completed
      }
      Intent::AdjustPlaybackSpeed(multiplier) => {
        self.playback.adjust_speed(multiplier);
        TaskOutcome::Completed
      }
      Intent::ClearLiveRoute => {
        self.live.clear();
        self.notices.info("Live route cleared");
        TaskOutcome::Completed
      }
    }
  }

  async fn load_historical(&self, mut query: FilterQuery) -> anyhow::Result<()> {
    if query.filter_by_boundary && query.boundary_id.is_none() {
      query.boundary_id = Some(self.config.resolved_boundary_id().to_string());
    }

    let collection = self
      .loader
      .load(&query)
      .await
      .context("loading historical data")?;
    *self.loaded.lock().unwrap() = collection.clone();

    let culled = self.cull_to_viewport(collection).await;
    self.render_historical(&culled, true);

    if culled.is_empty() {
      self
        .notices
        .info("No routes found for the selected filters");
    } else {
      self
        .notices
        .success(format!("Displaying {} routes", culled.len()));
    }
    Ok(())
  }

  async fn filter_to_viewport(&self) -> anyhow::Result<()> {
    let loaded = self.loaded.lock().unwrap().clone();
    if loaded.is_empty() {
      debug!("viewport filter with nothing loaded");
      return Ok(());
    }
    let culled = self.cull_to_viewport(loaded).await;
    // No fit_bounds here: the user is driving the viewport.
    self.render_historical(&culled, false);
    Ok(())
  }

  /// Bounding-box cull on the worker thread; falls back to the calling task
  /// if the worker is gone. No viewport means nothing to cull.
  async fn cull_to_viewport(&self, collection: FeatureCollection) -> FeatureCollection {
    let Some(bounds) = self.view.viewport() else {
      return collection;
    };
    match self.worker.filter_by_bounds(collection.clone(), bounds).await {
      Ok(filtered) => filtered,
      Err(WorkerError::WorkerGone) => {
        self
          .notices
          .warning("Filter worker unavailable, filtering on the main thread");
        bounds_filter(&collection, &bounds)
      }
    }
  }

  /// Replaces the historical layer wholesale and records what is shown.
  fn render_historical(&self, collection: &FeatureCollection, fit: bool) {
    self.view.remove_layer(LayerId::Historical);
    self.view.add_layer(LayerId::Historical, collection);
    if fit && !collection.is_empty() {
      let bounds = collection.bounding_box();
      if bounds.is_valid() {
        self.view.fit_bounds(bounds);
      }
    }
    *self.rendered.lock().unwrap() = collection.clone();
  }

  fn apply_polygon_filter(&self, ring: &[[f64; 2]]) {
    let Some(polygon) = polygon_from_ring(ring) else {
      self
        .notices
        .warning("Draw at least three points to filter by shape");
      return;
    };
    let rendered = self.rendered.lock().unwrap().clone();
    let filtered = polygon_filter(&rendered, &polygon);
    let empty = filtered.is_empty();
    self.render_historical(&filtered, false);
    if empty {
      self.notices.info("No routes within the drawn area");
    }
  }

  fn start_playback(&self, geometry: &RouteGeometry) {
    let segments: Vec<Vec<[f64; 2]>> = geometry
      .playable_segments()
      .into_iter()
      .map(<[[f64; 2]]>::to_vec)
      .collect();
    if segments.is_empty() {
      self
        .notices
        .warning("Selected route has no playable segment");
      return;
    }
    if let Err(e) = self.playback.start_segments(segments) {
      self.notices.warning(e.to_string());
    }
  }

  async fn export_gpx(&self, mut query: FilterQuery) -> anyhow::Result<()> {
    if query.filter_by_boundary && query.boundary_id.is_none() {
      query.boundary_id = Some(self.config.resolved_boundary_id().to_string());
    }
    let bytes = self
      .api
      .export_gpx(&query)
      .await
      .context("exporting GPX")?;
    let size = bytes.len();
    *self.gpx_export.lock().unwrap() = Some(bytes);
    self
      .notices
      .success(format!("GPX export ready ({size} bytes)"));
    Ok(())
  }

  async fn update_historical_data(&self) -> anyhow::Result<()> {
    let message = self
      .api
      .update_historical_data()
      .await
      .context("requesting historical data update")?;
    if !message.is_empty() {
      self.notices.info(message);
    }
    // New upstream data makes every cached range stale.
    self.loader.invalidate();
    self.await_historical_ready().await?;
    // Coverage progress is derived from the refreshed trips; recompute it
    // now rather than waiting for the next scheduled run.
    match self.api.update_progress().await {
      Ok(message) if !message.is_empty() => self.notices.info(message),
      Ok(_) => {}
      Err(e) => self
        .notices
        .warning(format!("Progress recompute failed: {e}")),
    }
    self.notices.success("Historical data updated");
    Ok(())
  }

  /// Polls the historical-data status until it reports ready, with a
  /// bounded number of attempts and a fixed backoff between them.
  async fn await_historical_ready(&self) -> anyhow::Result<()> {
    let attempts = self.config.resolved_status_retry_attempts().max(1);
    let backoff = self.config.status_retry_backoff();
    for attempt in 1..=attempts {
      match self.api.historical_data_status().await {
        Ok(status) if status.loaded && !status.loading => return Ok(()),
        Ok(_) => debug!("historical data not ready, attempt {attempt}/{attempts}"),
        Err(e) => warn!("status poll failed, attempt {attempt}/{attempts}: {e}"),
      }
      if attempt < attempts {
        tokio::time::sleep(backoff).await;
      }
    }
    anyhow::bail!("historical data not ready after {attempts} status checks")
  }

  #[must_use]
  pub fn notices(&self) -> &NoticeQueue {
    &self.notices
  }

  #[must_use]
  pub fn is_busy(&self) -> bool {
    self.serializer.is_processing()
  }

  /// Busy-indicator text, when a serialized task is running.
  #[must_use]
  pub fn status_message(&self) -> Option<String> {
    self.serializer.status_message()
  }

  #[must_use]
  pub fn playback_phase(&self) -> PlaybackPhase {
    self.playback.phase()
  }

  #[must_use]
  pub fn trip_metrics(&self) -> Option<TripMetrics> {
    self.metrics.latest()
  }

  /// Routes currently shown on the historical layer.
  #[must_use]
  pub fn rendered_routes(&self) -> FeatureCollection {
    self.rendered.lock().unwrap().clone()
  }

  /// Hands over the most recent GPX download, if any.
  #[must_use]
  pub fn take_gpx_export(&self) -> Option<Vec<u8>> {
    self.gpx_export.lock().unwrap().take()
  }
}
