//! Debounced, batched persistence of queued widget operations.
//!
//! One writer task runs per dashboard. It owns the debounce timer and is
//! driven through a `WriterHandle`:
//!
//! ```ignore
//! let writer = BatchWriter::new(dashboard_id, user_id, state, store, cache)
//!   .with_debounce(Duration::from_secs(1))
//!   .spawn();
//!
//! writer.schedule();            // (re)start the debounce window
//! writer.cancel();              // drop the timer, keep the queue
//! let outcome = writer.flush().await;
//! writer.set_reachable(false);  // connectivity signal
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::state::{lock, SharedState};
use crate::cache::CacheManager;
use crate::db::{DurableStore, StoreError};
use crate::widget::WidgetId;

/// Save status surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
  Idle,
  Saving,
  Saved,
  Error(String),
}

/// Result of one flush attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
  /// Nothing was queued; no request issued
  Empty,
  /// Network unreachable; the queue is kept for later
  Offline,
  Saved { operations: usize, created: usize },
  Failed(StoreError),
  /// The writer task is no longer running
  Stopped,
}

#[derive(Debug)]
enum Command {
  Schedule,
  Cancel,
  Flush(Option<oneshot::Sender<FlushOutcome>>),
  Reachability(bool),
  Shutdown,
}

/// Cancellable handle to a running writer task.
#[derive(Clone)]
pub struct WriterHandle {
  tx: mpsc::UnboundedSender<Command>,
  status: watch::Receiver<SaveStatus>,
}

impl WriterHandle {
  /// (Re)start the debounce window.
  pub fn schedule(&self) {
    self.send(Command::Schedule);
  }

  /// Cancel a pending timer. Queued intent stays for the next trigger.
  pub fn cancel(&self) {
    self.send(Command::Cancel);
  }

  /// Flush now and wait for the outcome.
  pub async fn flush(&self) -> FlushOutcome {
    let (tx, rx) = oneshot::channel();
    if self.tx.send(Command::Flush(Some(tx))).is_err() {
      return FlushOutcome::Stopped;
    }
    rx.await.unwrap_or(FlushOutcome::Stopped)
  }

  /// Flush now without waiting.
  #[allow(dead_code)]
  pub fn request_flush(&self) {
    self.send(Command::Flush(None));
  }

  /// Connectivity change notification.
  pub fn set_reachable(&self, online: bool) {
    self.send(Command::Reachability(online));
  }

  /// Stop the writer task. Pending timers are dropped, the queue is kept.
  pub fn shutdown(&self) {
    self.send(Command::Shutdown);
  }

  pub fn status(&self) -> SaveStatus {
    self.status.borrow().clone()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<SaveStatus> {
    self.status.clone()
  }

  fn send(&self, command: Command) {
    if self.tx.send(command).is_err() {
      debug!("writer task stopped, command dropped");
    }
  }
}

/// Converts queued intent into durable writes for one dashboard.
pub struct BatchWriter<D: DurableStore> {
  user_id: String,
  state: SharedState,
  store: Arc<D>,
  cache: CacheManager,
  debounce: Duration,
  retry: RetryPolicy,
  status: watch::Sender<SaveStatus>,
}

impl<D: DurableStore> BatchWriter<D> {
  pub fn new(user_id: &str, state: SharedState, store: Arc<D>, cache: CacheManager) -> Self {
    let (status, _) = watch::channel(SaveStatus::Idle);
    Self {
      user_id: user_id.to_string(),
      state,
      store,
      cache,
      debounce: Duration::from_secs(1),
      retry: RetryPolicy::default(),
      status,
    }
  }

  pub fn with_debounce(mut self, debounce: Duration) -> Self {
    self.debounce = debounce;
    self
  }

  pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Start the writer task on the current tokio runtime.
  pub fn spawn(self) -> WriterHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = WriterHandle {
      tx,
      status: self.status.subscribe(),
    };
    tokio::spawn(self.run(rx));
    handle
  }

  async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut deadline: Option<Instant> = None;
    let mut failures = 0u32;

    loop {
      let command = match deadline {
        Some(at) => tokio::select! {
          command = rx.recv() => command,
          () = tokio::time::sleep_until(at) => {
            debug!("flush timer fired");
            let outcome = self.flush().await;
            deadline = self.next_deadline(&outcome, &mut failures);
            continue;
          }
        },
        None => rx.recv().await,
      };

      match command {
        Some(Command::Schedule) => {
          failures = 0;
          deadline = Some(Instant::now() + self.debounce);
        }
        Some(Command::Cancel) => {
          debug!("flush timer cancelled");
          deadline = None;
        }
        Some(Command::Flush(reply)) => {
          failures = 0;
          let outcome = self.flush().await;
          deadline = self.next_deadline(&outcome, &mut failures);
          if let Some(reply) = reply {
            let _ = reply.send(outcome);
          }
        }
        Some(Command::Reachability(online)) => {
          let (restored, pending) = {
            let mut state = lock(&self.state);
            let restored = state.queue_mut().set_reachable(online);
            (restored, !state.queue().is_empty())
          };
          info!(online, "reachability changed");
          if restored && pending {
            failures = 0;
            let outcome = self.flush().await;
            deadline = self.next_deadline(&outcome, &mut failures);
          }
        }
        Some(Command::Shutdown) | None => break,
      }
    }

    debug!("writer task stopped");
  }

  /// Send one batch with everything queued.
  async fn flush(&self) -> FlushOutcome {
    let (dashboard_id, drained) = {
      let mut state = lock(&self.state);
      if !state.queue().is_reachable() {
        if state.queue().is_empty() {
          return FlushOutcome::Empty;
        }
        debug!(pending = state.queue().len(), "offline, flush deferred");
        return FlushOutcome::Offline;
      }
      match state.begin_flush() {
        Some(drained) => (state.dashboard_id().to_string(), drained),
        None => return FlushOutcome::Empty,
      }
    };

    let batch = drained.to_write_batch();
    self.status.send_replace(SaveStatus::Saving);
    debug!(
      dashboard_id = %dashboard_id,
      creates = batch.creates.len(),
      updates = batch.updates.len(),
      deletes = batch.deletes.len(),
      "flushing"
    );

    match self.store.batch_write(&dashboard_id, &batch).await {
      Ok(result) => {
        // Cache must not serve pre-write data once success is reported
        let written: Vec<WidgetId> = drained
          .widget_ids()
          .filter(|id| !id.is_temporary())
          .chain(result.created_ids.values())
          .cloned()
          .collect();
        self
          .cache
          .invalidate_widget_writes(&self.user_id, &dashboard_id, &written);

        let notification = {
          let mut state = lock(&self.state);
          state.complete_flush(&result);
          (!result.created_ids.is_empty()).then(|| state.notification())
        };
        if let Some(notification) = notification {
          notification.send();
        }

        self.status.send_replace(SaveStatus::Saved);
        info!(
          dashboard_id = %dashboard_id,
          operations = drained.len(),
          created = result.created_ids.len(),
          "flush saved"
        );
        FlushOutcome::Saved {
          operations: drained.len(),
          created: result.created_ids.len(),
        }
      }
      Err(e) => {
        warn!(dashboard_id = %dashboard_id, error = %e, "flush failed, requeueing batch");
        lock(&self.state).abort_flush(drained);
        self.status.send_replace(SaveStatus::Error(e.to_string()));
        FlushOutcome::Failed(e)
      }
    }
  }

  /// When to fire next, given how the last flush went.
  fn next_deadline(&self, outcome: &FlushOutcome, failures: &mut u32) -> Option<Instant> {
    match outcome {
      FlushOutcome::Failed(error) => {
        *failures += 1;
        match self.retry.next_delay(*failures, error) {
          Some(delay) => {
            debug!(attempt = *failures, ?delay, "scheduling retry");
            Some(Instant::now() + delay)
          }
          None => {
            if error.is_transient() {
              warn!(attempts = *failures, "retry budget spent, waiting for next trigger");
            }
            None
          }
        }
      }
      FlushOutcome::Saved { .. } => {
        *failures = 0;
        None
      }
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheKey, MemoryCache};
  use crate::db::MemoryStore;
  use crate::sync::queue::SyncOperation;
  use crate::sync::state::DashboardState;
  use crate::widget::{NewWidget, Position, Widget, WidgetKind, WidgetPatch};
  use chrono::Utc;

  const DEBOUNCE: Duration = Duration::from_millis(1000);

  struct Fixture {
    store: Arc<MemoryStore>,
    state: SharedState,
    cache: CacheManager,
  }

  fn fixture(widgets: Vec<Widget>) -> Fixture {
    let store = Arc::new(MemoryStore::new());
    store.insert_dashboard("d1", "u1", "Main");
    for w in &widgets {
      store.insert_widget(w.clone());
    }
    Fixture {
      store,
      state: DashboardState::new("d1", widgets).shared(),
      cache: CacheManager::new(Arc::new(MemoryCache::new()), "test"),
    }
  }

  impl Fixture {
    fn spawn(&self, retry: RetryPolicy) -> WriterHandle {
      BatchWriter::new("u1", self.state.clone(), self.store.clone(), self.cache.clone())
        .with_debounce(DEBOUNCE)
        .with_retry_policy(retry)
        .spawn()
    }

    fn enqueue(&self, op: SyncOperation) {
      lock(&self.state).queue_mut().enqueue(op);
    }
  }

  fn durable(id: &str) -> Widget {
    NewWidget::new(WidgetKind::Text).into_widget(
      WidgetId::new(id),
      "d1",
      Position::default(),
      Utc::now(),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn test_timer_fires_once_after_window() {
    let f = fixture(vec![durable("w1")]);
    let writer = f.spawn(RetryPolicy::disabled());

    f.enqueue(SyncOperation::update(WidgetId::new("w1"), WidgetPatch::title("A")));
    writer.schedule();

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(f.store.request_count(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(f.store.request_count(), 1);
    assert_eq!(writer.status(), SaveStatus::Saved);
  }

  #[tokio::test(start_paused = true)]
  async fn test_empty_flush_issues_no_request() {
    let f = fixture(Vec::new());
    let writer = f.spawn(RetryPolicy::disabled());
    assert_eq!(writer.flush().await, FlushOutcome::Empty);
    assert_eq!(f.store.request_count(), 0);
    assert_eq!(writer.status(), SaveStatus::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_keeps_queue() {
    let f = fixture(vec![durable("w1")]);
    let writer = f.spawn(RetryPolicy::disabled());

    f.enqueue(SyncOperation::update(WidgetId::new("w1"), WidgetPatch::title("A")));
    writer.schedule();
    writer.cancel();

    tokio::time::sleep(DEBOUNCE * 3).await;
    assert_eq!(f.store.request_count(), 0);
    assert_eq!(lock(&f.state).queue().len(), 1);

    // Next trigger delivers it
    assert!(matches!(writer.flush().await, FlushOutcome::Saved { .. }));
    assert_eq!(f.store.widgets("d1")[0].title, "A");
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_requeues_and_reports_error() {
    let f = fixture(vec![durable("w1")]);
    let writer = f.spawn(RetryPolicy::disabled());
    f.store.fail_next(StoreError::Unavailable("connection reset".into()));

    f.enqueue(SyncOperation::update(WidgetId::new("w1"), WidgetPatch::title("A")));
    let outcome = writer.flush().await;

    assert!(matches!(outcome, FlushOutcome::Failed(_)));
    assert!(matches!(writer.status(), SaveStatus::Error(_)));
    assert_eq!(lock(&f.state).queue().len(), 1);

    // Error clears on the next successful flush
    assert!(matches!(writer.flush().await, FlushOutcome::Saved { .. }));
    assert_eq!(writer.status(), SaveStatus::Saved);
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failure_retries_with_backoff() {
    let f = fixture(vec![durable("w1")]);
    let retry = RetryPolicy {
      max_attempts: 2,
      base_delay_ms: 500,
      max_delay_ms: 10_000,
    };
    let writer = f.spawn(retry);
    for _ in 0..3 {
      f.store.fail_next(StoreError::Unavailable("timeout".into()));
    }

    f.enqueue(SyncOperation::update(WidgetId::new("w1"), WidgetPatch::title("A")));
    writer.request_flush();

    // Initial attempt + 2 retries (500ms, 1000ms), then give up
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(f.store.request_count(), 3);
    assert!(matches!(writer.status(), SaveStatus::Error(_)));
    assert_eq!(lock(&f.state).queue().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_permanent_failure_is_not_retried() {
    let f = fixture(vec![durable("w1")]);
    let writer = f.spawn(RetryPolicy::default());
    f.store.fail_next(StoreError::Rejected("bad payload".into()));

    f.enqueue(SyncOperation::update(WidgetId::new("w1"), WidgetPatch::title("A")));
    writer.request_flush();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(f.store.request_count(), 1);
    assert!(matches!(writer.status(), SaveStatus::Error(_)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_success_invalidates_list_keys() {
    let f = fixture(vec![durable("w1")]);
    let writer = f.spawn(RetryPolicy::disabled());
    let widgets_key = CacheKey::widgets("u1", "d1");
    let dashboards_key = CacheKey::dashboards("u1");
    let files_key = CacheKey::files("u1", "d1");
    for key in [&widgets_key, &dashboards_key, &files_key] {
      f.cache.put(key, &"stale");
    }

    f.enqueue(SyncOperation::update(WidgetId::new("w1"), WidgetPatch::title("A")));
    assert!(matches!(writer.flush().await, FlushOutcome::Saved { .. }));

    assert!(!f.cache.contains(&widgets_key));
    assert!(!f.cache.contains(&dashboards_key));
    assert!(f.cache.contains(&files_key));
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_defers_until_restored() {
    let f = fixture(vec![durable("w1")]);
    let writer = f.spawn(RetryPolicy::disabled());

    writer.set_reachable(false);
    f.enqueue(SyncOperation::update(WidgetId::new("w1"), WidgetPatch::title("A")));
    writer.schedule();
    tokio::time::sleep(DEBOUNCE * 2).await;
    assert_eq!(writer.flush().await, FlushOutcome::Offline);
    assert_eq!(f.store.request_count(), 0);

    writer.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(f.store.request_count(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stopped_writer_reports_stopped() {
    let f = fixture(Vec::new());
    let writer = f.spawn(RetryPolicy::disabled());
    writer.shutdown();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(writer.flush().await, FlushOutcome::Stopped);
  }
}
