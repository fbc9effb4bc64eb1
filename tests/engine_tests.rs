//! End-to-end engine behavior through the public API: a mock backend, a
//! recording view, and intents dispatched the way a host UI would.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use trackview::api::{ApiError, TrackerApi};
use trackview::config::Config;
use trackview::engine::serializer::TaskOutcome;
use trackview::map_view::{LayerId, RecordingView, ViewOp};
use trackview::model::{
  FeatureCollection, FilterQuery, HistoricalStatus, RouteFeature, TrackPoint, TripMetrics,
};
use trackview::{Engine, Intent};

struct MockBackend {
  historical: FeatureCollection,
  historical_delay: Duration,
  historical_calls: AtomicUsize,
  processing: bool,
  status_calls: AtomicUsize,
}

impl Default for MockBackend {
  fn default() -> Self {
    Self {
      historical: FeatureCollection::default(),
      historical_delay: Duration::ZERO,
      historical_calls: AtomicUsize::new(0),
      processing: false,
      status_calls: AtomicUsize::new(0),
    }
  }
}

#[async_trait]
impl TrackerApi for MockBackend {
  async fn historical_data(&self, _: &FilterQuery) -> Result<FeatureCollection, ApiError> {
    self.historical_calls.fetch_add(1, Ordering::SeqCst);
    if !self.historical_delay.is_zero() {
      tokio::time::sleep(self.historical_delay).await;
    }
    Ok(self.historical.clone())
  }

  async fn historical_data_status(&self) -> Result<HistoricalStatus, ApiError> {
    // Reports "still loading" on the first poll, ready afterwards.
    let first = self.status_calls.fetch_add(1, Ordering::SeqCst) == 0;
    Ok(HistoricalStatus {
      loaded: !first,
      loading: first,
    })
  }

  async fn live_data(&self) -> Result<Option<TrackPoint>, ApiError> {
    Ok(None)
  }

  async fn latest_raw(&self) -> Result<Option<TrackPoint>, ApiError> {
    Ok(None)
  }

  async fn live_route(&self) -> Result<FeatureCollection, ApiError> {
    Ok(FeatureCollection::default())
  }

  async fn trip_metrics(&self) -> Result<TripMetrics, ApiError> {
    Ok(TripMetrics::default())
  }

  async fn export_gpx(&self, _: &FilterQuery) -> Result<Vec<u8>, ApiError> {
    Ok(Vec::new())
  }

  async fn update_historical_data(&self) -> Result<String, ApiError> {
    Ok("Update started".to_string())
  }

  async fn update_progress(&self) -> Result<String, ApiError> {
    Ok(String::new())
  }

  async fn processing_status(&self) -> Result<bool, ApiError> {
    Ok(self.processing)
  }
}

fn routes() -> FeatureCollection {
  FeatureCollection::new(vec![RouteFeature::line_string(
    vec![[-97.15, 31.54], [-97.12, 31.56]],
    Some(1_706_000_000),
  )])
}

fn query() -> FilterQuery {
  FilterQuery {
    start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    end_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
    filter_by_boundary: false,
    boundary_id: None,
  }
}

fn engine_with(backend: MockBackend) -> (Arc<MockBackend>, Arc<RecordingView>, Engine) {
  let _ = env_logger::builder().is_test(true).try_init();
  let backend = Arc::new(backend);
  let view = Arc::new(RecordingView::new());
  let config = Config {
    status_retry_backoff_secs: Some(0),
    ..Config::default()
  };
  let engine = Engine::new(backend.clone(), view.clone(), config);
  (backend, view, engine)
}

#[tokio::test]
async fn concurrent_identical_loads_queue_and_share_one_fetch() {
  let (backend, view, engine) = engine_with(MockBackend {
    historical: routes(),
    historical_delay: Duration::from_millis(20),
    ..MockBackend::default()
  });

  let first = engine.dispatch(Intent::LoadHistorical(query()));
  let second = engine.dispatch(Intent::LoadHistorical(query()));
  let (first, second) = futures::join!(first, second);

  assert_eq!(first, TaskOutcome::Completed);
  assert_eq!(second, TaskOutcome::Queued);
  // The queued load ran after the first settled and hit the cache.
  assert_eq!(backend.historical_calls.load(Ordering::SeqCst), 1);
  assert!(!engine.is_busy());

  let adds = view
    .ops()
    .iter()
    .filter(|op| matches!(op, ViewOp::AddLayer(LayerId::Historical, 1)))
    .count();
  assert_eq!(adds, 2, "both loads rendered the layer");
}

#[tokio::test]
async fn viewport_filter_is_rejected_while_a_load_runs() {
  let (_backend, _view, engine) = engine_with(MockBackend {
    historical: routes(),
    historical_delay: Duration::from_millis(20),
    ..MockBackend::default()
  });

  let load = engine.dispatch(Intent::LoadHistorical(query()));
  let filter = async {
    // Let the load grab the serializer first.
    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.dispatch(Intent::FilterToViewport).await
  };
  let (load, filter) = futures::join!(load, filter);

  assert_eq!(load, TaskOutcome::Completed);
  assert_eq!(filter, TaskOutcome::Rejected);
  assert!(engine
    .notices()
    .active()
    .iter()
    .any(|n| n.message.contains("already in progress")));
}

#[tokio::test]
async fn busy_message_is_visible_during_a_load() {
  let (_backend, _view, engine) = engine_with(MockBackend {
    historical: routes(),
    historical_delay: Duration::from_millis(30),
    ..MockBackend::default()
  });

  let inner = engine.clone();
  let load = tokio::spawn(async move { inner.dispatch(Intent::LoadHistorical(query())).await });
  tokio::time::sleep(Duration::from_millis(10)).await;

  assert!(engine.is_busy());
  assert_eq!(
    engine.status_message().as_deref(),
    Some("Loading historical data...")
  );

  load.await.unwrap();
  assert!(!engine.is_busy());
  assert_eq!(engine.status_message(), None);
}

#[tokio::test]
async fn startup_against_a_processing_backend_locks_the_engine() {
  let (backend, _view, engine) = engine_with(MockBackend {
    processing: true,
    ..MockBackend::default()
  });

  engine.startup().await;

  // The lock task is spawned; give it a chance to take the serializer.
  tokio::time::sleep(Duration::from_millis(10)).await;
  assert_eq!(
    engine.status_message().as_deref(),
    Some("Processing historical data...")
  );

  // The status endpoint reports ready on its second poll (zero backoff),
  // after which the engine unlocks on its own.
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert!(!engine.is_busy());
  assert!(backend.status_calls.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn queued_load_runs_even_if_the_first_fails_midway() {
  struct FlakyBackend {
    calls: AtomicUsize,
  }

  #[async_trait]
  impl TrackerApi for FlakyBackend {
    async fn historical_data(&self, _: &FilterQuery) -> Result<FeatureCollection, ApiError> {
      if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        return Err(ApiError::Status { status: 502 });
      }
      Ok(routes())
    }
    async fn historical_data_status(&self) -> Result<HistoricalStatus, ApiError> {
      unreachable!()
    }
    async fn live_data(&self) -> Result<Option<TrackPoint>, ApiError> {
      Ok(None)
    }
    async fn latest_raw(&self) -> Result<Option<TrackPoint>, ApiError> {
      Ok(None)
    }
    async fn live_route(&self) -> Result<FeatureCollection, ApiError> {
      Ok(FeatureCollection::default())
    }
    async fn trip_metrics(&self) -> Result<TripMetrics, ApiError> {
      Ok(TripMetrics::default())
    }
    async fn export_gpx(&self, _: &FilterQuery) -> Result<Vec<u8>, ApiError> {
      Ok(Vec::new())
    }
    async fn update_historical_data(&self) -> Result<String, ApiError> {
      unreachable!()
    }
    async fn update_progress(&self) -> Result<String, ApiError> {
      unreachable!()
    }
    async fn processing_status(&self) -> Result<bool, ApiError> {
      Ok(false)
    }
  }

  let _ = env_logger::builder().is_test(true).try_init();
  let view = Arc::new(RecordingView::new());
  let engine = Engine::new(
    Arc::new(FlakyBackend {
      calls: AtomicUsize::new(0),
    }),
    view,
    Config::default(),
  );

  let first = engine.dispatch(Intent::LoadHistorical(query()));
  let second = engine.dispatch(Intent::LoadHistorical(FilterQuery {
    start_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
    ..query()
  }));
  let (first, second) = futures::join!(first, second);

  assert_eq!(first, TaskOutcome::Failed);
  assert_eq!(second, TaskOutcome::Queued);
  // The failure was reported and the queued load still rendered its routes.
  assert!(engine
    .notices()
    .active()
    .iter()
    .any(|n| n.message.contains("502") || n.message.contains("status")));
  assert_eq!(engine.rendered_routes().len(), 1);
  assert!(!engine.is_busy());
}
