//! The feedback channel: timed, auto-dismissing notices.
//!
//! Purely presentational, but it is the engine's only error-visibility
//! mechanism: every async outcome, success or failure, is routed through
//! here so the user can always see what the pipeline did.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  Info,
  Success,
  Warning,
  Error,
}

#[derive(Debug, Clone)]
pub struct Notice {
  pub message: String,
  pub severity: Severity,
  expires_at: Instant,
}

impl Notice {
  #[must_use]
  pub fn is_expired(&self) -> bool {
    Instant::now() >= self.expires_at
  }
}

const DEFAULT_DURATION: Duration = Duration::from_secs(5);

/// Queue of active notices. Cheap to clone; all clones share the queue.
#[derive(Debug, Clone, Default)]
pub struct NoticeQueue {
  notices: Arc<Mutex<Vec<Notice>>>,
}

impl NoticeQueue {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  pub fn notify(&self, message: impl Into<String>, severity: Severity, duration: Duration) {
    let message = message.into();
    match severity {
      Severity::Error => log::error!("{message}"),
      Severity::Warning => log::warn!("{message}"),
      Severity::Info | Severity::Success => log::info!("{message}"),
    }
    self.notices.lock().unwrap().push(Notice {
      message,
      severity,
      expires_at: Instant::now() + duration,
    });
  }

  pub fn info(&self, message: impl Into<String>) {
    self.notify(message, Severity::Info, DEFAULT_DURATION);
  }

  pub fn success(&self, message: impl Into<String>) {
    self.notify(message, Severity::Success, DEFAULT_DURATION);
  }

  pub fn warning(&self, message: impl Into<String>) {
    self.notify(message, Severity::Warning, DEFAULT_DURATION);
  }

  pub fn error(&self, message: impl Into<String>) {
    self.notify(message, Severity::Error, DEFAULT_DURATION);
  }

  /// Active notices, pruning expired ones as a side effect.
  #[must_use]
  pub fn active(&self) -> Vec<Notice> {
    let mut notices = self.notices.lock().unwrap();
    notices.retain(|n| !n.is_expired());
    notices.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn notices_expire() {
    let queue = NoticeQueue::new();
    queue.notify("short lived", Severity::Info, Duration::from_millis(0));
    queue.notify("long lived", Severity::Error, Duration::from_secs(60));

    let active = queue.active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].message, "long lived");
    assert_eq!(active[0].severity, Severity::Error);
  }

  #[test]
  fn clones_share_the_queue() {
    let queue = NoticeQueue::new();
    let clone = queue.clone();
    clone.success("done");
    assert_eq!(queue.active().len(), 1);
  }
}
