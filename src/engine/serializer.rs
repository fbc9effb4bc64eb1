//! Mutual exclusion for background work that touches shared map state.
//!
//! At most one gated task runs at any time. A task arriving while another
//! one runs is either rejected with a warning notice or parked in a FIFO
//! queue, chosen per call site via [`BusyPolicy`]. While a task runs, the
//! host is expected to disable interactive controls and show
//! [`TaskSerializer::status_message`].

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::engine::notify::NoticeQueue;

type BoxedTask = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// What to do with a task that arrives while another one is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
  /// Drop the request and surface a "task already in progress" warning.
  Reject,
  /// Park the task; it runs after the current task (and earlier queued
  /// tasks) have settled.
  Enqueue,
}

/// How a `run_exclusive` call ended, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
  Completed,
  Failed,
  Rejected,
  Queued,
}

struct QueuedTask {
  label: String,
  task: BoxedTask,
}

#[derive(Default)]
struct Inner {
  /// Status message of the running task; `None` means idle.
  processing: Option<String>,
  queue: VecDeque<QueuedTask>,
}

/// Clears the processing flag if a running task is dropped mid-flight, so a
/// cancelled task can never leave the serializer locked.
struct ReleaseGuard {
  inner: Arc<Mutex<Inner>>,
  armed: bool,
}

impl ReleaseGuard {
  fn new(inner: Arc<Mutex<Inner>>) -> Self {
    Self { inner, armed: true }
  }

  fn disarm(&mut self) {
    self.armed = false;
  }
}

impl Drop for ReleaseGuard {
  fn drop(&mut self) {
    if self.armed {
      self.inner.lock().unwrap().processing = None;
    }
  }
}

#[derive(Clone)]
pub struct TaskSerializer {
  inner: Arc<Mutex<Inner>>,
  notices: NoticeQueue,
}

impl TaskSerializer {
  #[must_use]
  pub fn new(notices: NoticeQueue) -> Self {
    Self {
      inner: Arc::default(),
      notices,
    }
  }

  #[must_use]
  pub fn is_processing(&self) -> bool {
    self.inner.lock().unwrap().processing.is_some()
  }

  /// Status message of the running task, for the host's busy indicator.
  #[must_use]
  pub fn status_message(&self) -> Option<String> {
    self.inner.lock().unwrap().processing.clone()
  }

  #[must_use]
  pub fn queued_len(&self) -> usize {
    self.inner.lock().unwrap().queue.len()
  }

  /// Runs `task` exclusively, then drains the queue.
  ///
  /// Task errors are reported through the feedback channel here and never
  /// propagate; success messaging is left to the task body, which knows
  /// what it did. The returned outcome describes this call's own task.
  pub async fn run_exclusive<F>(
    &self,
    label: impl Into<String>,
    policy: BusyPolicy,
    task: F,
  ) -> TaskOutcome
  where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
  {
    let label = label.into();
    let task: BoxedTask = Box::pin(task);

    {
      let mut inner = self.inner.lock().unwrap();
      if inner.processing.is_some() {
        return match policy {
          BusyPolicy::Reject => {
            self
              .notices
              .warning(format!("{label}: another task is already in progress"));
            TaskOutcome::Rejected
          }
          BusyPolicy::Enqueue => {
            log::debug!("Queueing task: {label}");
            inner.queue.push_back(QueuedTask { label, task });
            TaskOutcome::Queued
          }
        };
      }
      inner.processing = Some(label.clone());
    }

    let mut current = QueuedTask { label, task };
    let mut own_outcome = None;
    loop {
      let mut guard = ReleaseGuard::new(self.inner.clone());
      log::debug!("Running task: {}", current.label);
      let result = current.task.await;
      let outcome = match result {
        Ok(()) => TaskOutcome::Completed,
        Err(e) => {
          self.notices.error(format!("{}: {e:#}", current.label));
          TaskOutcome::Failed
        }
      };
      own_outcome.get_or_insert(outcome);
      guard.disarm();

      let next = {
        let mut inner = self.inner.lock().unwrap();
        match inner.queue.pop_front() {
          Some(queued) => {
            inner.processing = Some(queued.label.clone());
            Some(queued)
          }
          None => {
            inner.processing = None;
            None
          }
        }
      };
      match next {
        Some(queued) => current = queued,
        None => break,
      }
    }
    own_outcome.unwrap_or(TaskOutcome::Completed)
  }
}
