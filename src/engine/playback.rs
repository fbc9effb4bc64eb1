//! Frame-stepped replay of a recorded route.
//!
//! One session at a time: starting a new replay synchronously cancels the
//! previous ticker before arming its own, so two tickers can never race on
//! the playback polyline. A multi-segment route plays one segment per
//! sub-session: advancing to the next segment clears the playback layer and
//! restarts the polyline there, so disjoint trips are never bridged by an
//! edge nobody drove. The ticker runs at `100ms / speed`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::map_view::{LayerId, MapView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
  Idle,
  Playing,
  Paused,
  Completed,
}

#[derive(Error, Debug)]
pub enum PlaybackError {
  #[error("route needs at least two coordinates to animate")]
  RouteTooShort,
}

struct Session {
  segments: Vec<Vec<[f64; 2]>>,
  segment_index: usize,
  current_index: usize,
  /// Points drawn for the current segment, the restart source for speed
  /// changes.
  drawn: Vec<[f64; 2]>,
}

struct Inner {
  phase: PlaybackPhase,
  speed: f64,
  session: Option<Session>,
  ticker: Option<JoinHandle<()>>,
}

impl Drop for Inner {
  fn drop(&mut self) {
    if let Some(ticker) = self.ticker.take() {
      ticker.abort();
    }
  }
}

/// Handle to the playback machine. Clones share one session.
#[derive(Clone)]
pub struct Playback {
  inner: Arc<Mutex<Inner>>,
  view: Arc<dyn MapView>,
  base_tick: Duration,
}

impl Playback {
  #[must_use]
  pub fn new(view: Arc<dyn MapView>, base_tick: Duration) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        phase: PlaybackPhase::Idle,
        speed: 1.0,
        session: None,
        ticker: None,
      })),
      view,
      base_tick,
    }
  }

  #[must_use]
  pub fn phase(&self) -> PlaybackPhase {
    self.inner.lock().unwrap().phase
  }

  #[must_use]
  pub fn speed(&self) -> f64 {
    self.inner.lock().unwrap().speed
  }

  /// Interval the ticker is (or would be) armed with.
  #[must_use]
  pub fn tick_period(&self) -> Duration {
    self.base_tick.div_f64(self.inner.lock().unwrap().speed)
  }

  /// `(applied ticks, total coordinates)` within the current segment.
  #[must_use]
  pub fn progress(&self) -> Option<(usize, usize)> {
    let inner = self.inner.lock().unwrap();
    inner
      .session
      .as_ref()
      .map(|s| (s.current_index, s.segments[s.segment_index].len()))
  }

  #[must_use]
  pub fn ticker_armed(&self) -> bool {
    self
      .inner
      .lock()
      .unwrap()
      .ticker
      .as_ref()
      .is_some_and(|t| !t.is_finished())
  }

  /// Starts replaying a single run of coordinates, superseding any running
  /// session.
  pub fn start(&self, coordinates: Vec<[f64; 2]>) -> Result<(), PlaybackError> {
    self.start_segments(vec![coordinates])
  }

  /// Starts replaying a multi-segment route, one sub-session per segment.
  pub fn start_segments(&self, segments: Vec<Vec<[f64; 2]>>) -> Result<(), PlaybackError> {
    self.begin_segments(segments)?;
    self.arm_ticker();
    Ok(())
  }

  /// Session setup without arming the ticker; `apply_tick` drives it.
  fn begin_segments(&self, mut segments: Vec<Vec<[f64; 2]>>) -> Result<(), PlaybackError> {
    segments.retain(|s| s.len() >= 2);
    if segments.is_empty() {
      return Err(PlaybackError::RouteTooShort);
    }
    let mut inner = self.inner.lock().unwrap();
    if let Some(ticker) = inner.ticker.take() {
      ticker.abort();
    }
    self.view.clear_layer(LayerId::Playback);
    self.view.set_marker(LayerId::Playback, segments[0][0]);
    inner.session = Some(Session {
      segments,
      segment_index: 0,
      current_index: 0,
      drawn: Vec::new(),
    });
    inner.phase = PlaybackPhase::Playing;
    Ok(())
  }

  fn arm_ticker(&self) {
    let period = self.tick_period();
    let this = self.clone();
    let handle = tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        interval.tick().await;
        if !this.apply_tick() {
          break;
        }
      }
    });
    self.inner.lock().unwrap().ticker = Some(handle);
  }

  /// Applies one tick. Returns whether the ticker should stay armed.
  fn apply_tick(&self) -> bool {
    let mut inner = self.inner.lock().unwrap();
    match inner.phase {
      // Paused keeps the ticker alive, ticks just aren't applied.
      PlaybackPhase::Paused => return true,
      PlaybackPhase::Playing => {}
      PlaybackPhase::Idle | PlaybackPhase::Completed => return false,
    }
    let Some(session) = inner.session.as_mut() else {
      return false;
    };
    if session.current_index < session.segments[session.segment_index].len() {
      let coord = session.segments[session.segment_index][session.current_index];
      self.view.set_marker(LayerId::Playback, coord);
      self.view.append_polyline_point(LayerId::Playback, coord);
      session.drawn.push(coord);
      session.current_index += 1;
      true
    } else if session.segment_index + 1 < session.segments.len() {
      // Next segment is its own sub-session: restart the polyline there
      // instead of drawing an edge between disjoint trips.
      session.segment_index += 1;
      session.current_index = 0;
      session.drawn.clear();
      let first = session.segments[session.segment_index][0];
      self.view.clear_layer(LayerId::Playback);
      self.view.set_marker(LayerId::Playback, first);
      true
    } else {
      log::debug!("playback completed");
      inner.phase = PlaybackPhase::Completed;
      false
    }
  }

  /// Switches between `Playing` and `Paused` without touching progress.
  pub fn toggle_play_pause(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.phase = match inner.phase {
      PlaybackPhase::Playing => PlaybackPhase::Paused,
      PlaybackPhase::Paused => PlaybackPhase::Playing,
      other => other,
    };
  }

  /// Cancels the session and clears the playback layer. Calling it again
  /// with nothing running is a no-op.
  pub fn stop(&self) {
    let mut inner = self.inner.lock().unwrap();
    if inner.session.is_none() && inner.ticker.is_none() {
      return;
    }
    if let Some(ticker) = inner.ticker.take() {
      ticker.abort();
    }
    inner.session = None;
    inner.phase = PlaybackPhase::Idle;
    self.view.clear_layer(LayerId::Playback);
  }

  /// Changes the replay speed. While playing, the ticker restarts at the
  /// new interval and the already-drawn points of the current segment become
  /// the new coordinate source (followed by the remaining segments), so
  /// progress resumes from the current visual state rather than the route
  /// start. The drawn polyline is left on the map. While paused, the ticker
  /// is re-armed at the new interval so resuming uses it immediately.
  pub fn adjust_speed(&self, multiplier: f64) {
    let multiplier = if multiplier > 0.0 { multiplier } else { 1.0 };
    let restart = {
      let mut inner = self.inner.lock().unwrap();
      inner.speed = multiplier;
      match inner.phase {
        PlaybackPhase::Playing => {
          if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
          }
          let segments = inner.session.as_ref().map_or_else(Vec::new, |s| {
            let mut segments = vec![s.drawn.clone()];
            segments.extend(s.segments[s.segment_index + 1..].iter().cloned());
            segments
          });
          inner.session = Some(Session {
            segments,
            segment_index: 0,
            current_index: 0,
            drawn: Vec::new(),
          });
          true
        }
        PlaybackPhase::Paused => {
          // Session untouched; only the interval changes.
          if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
            true
          } else {
            false
          }
        }
        PlaybackPhase::Idle | PlaybackPhase::Completed => false,
      }
    };
    if restart {
      self.arm_ticker();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::map_view::{RecordingView, ViewOp};

  fn setup() -> (Arc<RecordingView>, Playback) {
    let view = Arc::new(RecordingView::new());
    let playback = Playback::new(view.clone(), Duration::from_millis(100));
    (view, playback)
  }

  fn route() -> Vec<[f64; 2]> {
    vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]
  }

  #[tokio::test]
  async fn ticks_advance_monotonically_to_completion() {
    let (view, playback) = setup();
    playback.begin_segments(vec![route()]).unwrap();

    let mut applied = 0;
    while playback.apply_tick() {
      applied += 1;
      assert!(applied <= 4, "tick count must not exceed route length");
    }
    assert_eq!(applied, 4);
    assert_eq!(playback.phase(), PlaybackPhase::Completed);
    assert_eq!(view.polyline_points(LayerId::Playback), route());
    assert_eq!(view.last_marker(LayerId::Playback), Some([3.0, 3.0]));
  }

  #[tokio::test(start_paused = true)]
  async fn armed_ticker_terminates_on_its_own() {
    let (_view, playback) = setup();
    playback.start(route()).unwrap();
    assert_eq!(playback.phase(), PlaybackPhase::Playing);

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(playback.phase(), PlaybackPhase::Completed);
    assert!(!playback.ticker_armed());
  }

  #[tokio::test]
  async fn short_routes_are_refused() {
    let (view, playback) = setup();
    assert!(matches!(
      playback.start(vec![[0.0, 0.0]]),
      Err(PlaybackError::RouteTooShort)
    ));
    assert_eq!(playback.phase(), PlaybackPhase::Idle);
    assert!(view.ops().is_empty());
  }

  #[tokio::test]
  async fn disjoint_segments_never_share_a_polyline() {
    let (view, playback) = setup();
    playback
      .begin_segments(vec![
        vec![[0.0, 0.0], [1.0, 0.0]],
        vec![[100.0, 100.0], [101.0, 100.0]],
      ])
      .unwrap();

    let mut applied = 0;
    while playback.apply_tick() {
      applied += 1;
      assert!(applied <= 5, "two segments plus one boundary tick");
    }
    assert_eq!(playback.phase(), PlaybackPhase::Completed);

    // The layer is cleared at the segment boundary, so the appends after
    // the last clear are exactly the second segment.
    let ops = view.ops();
    let last_clear = ops
      .iter()
      .rposition(|op| matches!(op, ViewOp::ClearLayer(LayerId::Playback)))
      .unwrap();
    let after: Vec<[f64; 2]> = ops[last_clear..]
      .iter()
      .filter_map(|op| match op {
        ViewOp::AppendPolylinePoint(LayerId::Playback, p) => Some(*p),
        _ => None,
      })
      .collect();
    assert_eq!(after, vec![[100.0, 100.0], [101.0, 100.0]]);
  }

  #[tokio::test]
  async fn pause_holds_progress_and_resume_continues() {
    let (_view, playback) = setup();
    playback.begin_segments(vec![route()]).unwrap();

    assert!(playback.apply_tick());
    playback.toggle_play_pause();
    assert_eq!(playback.phase(), PlaybackPhase::Paused);

    // Paused ticks keep the ticker alive but apply nothing.
    assert!(playback.apply_tick());
    assert_eq!(playback.progress(), Some((1, 4)));

    playback.toggle_play_pause();
    assert!(playback.apply_tick());
    assert_eq!(playback.progress(), Some((2, 4)));
  }

  #[tokio::test]
  async fn stop_twice_is_a_no_op_the_second_time() {
    let (view, playback) = setup();
    playback.begin_segments(vec![route()]).unwrap();
    playback.stop();
    let ops_after_first = view.ops().len();

    playback.stop();
    assert_eq!(view.ops().len(), ops_after_first, "no duplicate layer removal");
    assert_eq!(playback.phase(), PlaybackPhase::Idle);
  }

  #[tokio::test]
  async fn starting_a_new_session_supersedes_the_old_one() {
    let (_view, playback) = setup();
    playback.start(route()).unwrap();
    playback
      .start(vec![[9.0, 9.0], [8.0, 8.0]])
      .unwrap();
    assert_eq!(playback.progress(), Some((0, 2)));
    assert_eq!(playback.phase(), PlaybackPhase::Playing);
  }

  #[tokio::test]
  async fn speed_change_restarts_from_the_drawn_prefix() {
    let (view, playback) = setup();
    playback.begin_segments(vec![route()]).unwrap();
    assert!(playback.apply_tick());
    assert!(playback.apply_tick());
    let ops_before = view.ops().len();

    playback.adjust_speed(2.0);

    assert_eq!(playback.tick_period(), Duration::from_millis(50));
    // The two drawn points are the new coordinate source.
    assert_eq!(playback.progress(), Some((0, 2)));
    // The speed change itself leaves the drawn polyline on the map.
    assert!(!view.ops()[ops_before..]
      .iter()
      .any(|op| matches!(op, ViewOp::ClearLayer(LayerId::Playback))));
  }

  #[tokio::test]
  async fn speed_change_while_paused_rearms_the_ticker() {
    let (_view, playback) = setup();
    playback.start(route()).unwrap();
    playback.toggle_play_pause();

    playback.adjust_speed(2.0);

    assert_eq!(playback.phase(), PlaybackPhase::Paused);
    assert_eq!(playback.tick_period(), Duration::from_millis(50));
    assert!(playback.ticker_armed());
    // Progress is untouched; resuming continues where the pause left off.
    assert_eq!(playback.progress(), Some((0, 4)));
  }

  #[tokio::test]
  async fn adjusting_speed_while_idle_only_changes_the_period() {
    let (_view, playback) = setup();
    playback.adjust_speed(4.0);
    assert_eq!(playback.tick_period(), Duration::from_millis(25));
    assert_eq!(playback.phase(), PlaybackPhase::Idle);
  }
}
