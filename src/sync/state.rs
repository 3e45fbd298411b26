//! State shared by the widget store and the batch writer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::queue::{Drained, MutationQueue};
use crate::db::BatchWriteResult;
use crate::widget::{Widget, WidgetId};

/// Callback receiving the full widget collection after every change.
pub type Listener = Arc<dyn Fn(&[Widget]) + Send + Sync>;

pub type SharedState = Arc<Mutex<DashboardState>>;

/// Lock shared state. Every critical section is short and synchronous.
pub fn lock(state: &SharedState) -> MutexGuard<'_, DashboardState> {
  state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Where a widget is in its round trip to the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetSyncState {
  /// Temporary id, never flushed
  LocalOnly,
  /// Part of a batch currently in flight
  FlushPending,
  /// Durable id, nothing pending
  Durable,
  /// Durable id with newer pending operations
  LocalDirty,
}

/// In-memory widgets of one dashboard together with their pending intent.
pub struct DashboardState {
  dashboard_id: String,
  widgets: Vec<Widget>,
  queue: MutationQueue,
  /// Reconciled temporary ids -> durable ids
  aliases: HashMap<WidgetId, WidgetId>,
  in_flight: HashSet<WidgetId>,
  /// Batches taken off the queue so far
  flushes: u64,
  listeners: Vec<Listener>,
}

impl DashboardState {
  pub fn new(dashboard_id: impl Into<String>, widgets: Vec<Widget>) -> Self {
    Self {
      dashboard_id: dashboard_id.into(),
      widgets,
      queue: MutationQueue::new(),
      aliases: HashMap::new(),
      in_flight: HashSet::new(),
      flushes: 0,
      listeners: Vec::new(),
    }
  }

  pub fn shared(self) -> SharedState {
    Arc::new(Mutex::new(self))
  }

  pub fn dashboard_id(&self) -> &str {
    &self.dashboard_id
  }

  pub fn widgets(&self) -> &[Widget] {
    &self.widgets
  }

  pub fn widgets_mut(&mut self) -> &mut Vec<Widget> {
    &mut self.widgets
  }

  pub fn queue(&self) -> &MutationQueue {
    &self.queue
  }

  pub fn queue_mut(&mut self) -> &mut MutationQueue {
    &mut self.queue
  }

  /// Follow a reconciled temporary id to the widget's current id.
  pub fn resolve(&self, id: &WidgetId) -> WidgetId {
    self.aliases.get(id).cloned().unwrap_or_else(|| id.clone())
  }

  pub fn find(&self, id: &WidgetId) -> Option<&Widget> {
    let id = self.resolve(id);
    self.widgets.iter().find(|w| w.id == id)
  }

  pub fn add_listener(&mut self, listener: Listener) {
    self.listeners.push(listener);
  }

  /// Take the queue contents for a flush and mark them in flight.
  pub fn begin_flush(&mut self) -> Option<Drained> {
    if self.queue.is_empty() {
      return None;
    }
    let drained = self.queue.drain();
    self.in_flight = drained.widget_ids().cloned().collect();
    self.flushes += 1;
    Some(drained)
  }

  /// How many flushes have started. A read that began before the count
  /// moved may predate a write.
  pub fn flushes_started(&self) -> u64 {
    self.flushes
  }

  pub fn is_in_flight(&self, id: &WidgetId) -> bool {
    self.in_flight.contains(&self.resolve(id))
  }

  /// Apply a successful flush: swap temporary ids for durable ones.
  ///
  /// Only the id changes. Edits made while the batch was in flight stay on
  /// the widget, and operations queued under the temporary id move over.
  pub fn complete_flush(&mut self, result: &BatchWriteResult) {
    self.in_flight.clear();
    for (temp, durable) in &result.created_ids {
      if let Some(widget) = self.widgets.iter_mut().find(|w| &w.id == temp) {
        widget.id = durable.clone();
      }
      self.queue.rekey(temp, durable);
      self.aliases.insert(temp.clone(), durable.clone());
      debug!(temp = %temp, durable = %durable, "reconciled widget id");
    }
  }

  /// Return a failed batch to the queue.
  pub fn abort_flush(&mut self, drained: Drained) {
    self.in_flight.clear();
    self.queue.requeue(drained);
  }

  pub fn sync_state(&self, id: &WidgetId) -> Option<WidgetSyncState> {
    let widget = self.find(id)?;
    let state = if self.in_flight.contains(&widget.id) {
      WidgetSyncState::FlushPending
    } else if widget.id.is_temporary() {
      WidgetSyncState::LocalOnly
    } else if self.queue.get(&widget.id).is_some() {
      WidgetSyncState::LocalDirty
    } else {
      WidgetSyncState::Durable
    };
    Some(state)
  }

  /// Snapshot for listeners, to be delivered after the lock is released.
  pub fn notification(&self) -> Notification {
    Notification {
      widgets: self.widgets.clone(),
      listeners: self.listeners.clone(),
    }
  }
}

/// Widget snapshot plus the listeners that should see it.
pub struct Notification {
  widgets: Vec<Widget>,
  listeners: Vec<Listener>,
}

impl Notification {
  pub fn send(self) {
    for listener in &self.listeners {
      listener(&self.widgets);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::queue::SyncOperation;
  use crate::widget::{NewWidget, Position, WidgetKind, WidgetPatch};
  use chrono::Utc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn widget(id: WidgetId) -> Widget {
    NewWidget::new(WidgetKind::Table).into_widget(id, "d1", Position::default(), Utc::now())
  }

  #[test]
  fn test_state_machine_round_trip() {
    let temp = WidgetId::temporary();
    let durable = WidgetId::new("7");
    let mut state = DashboardState::new("d1", vec![widget(temp.clone())]);
    state.queue_mut().enqueue(SyncOperation::create(widget(temp.clone())));
    assert_eq!(state.sync_state(&temp), Some(WidgetSyncState::LocalOnly));

    state.begin_flush().unwrap();
    assert_eq!(state.sync_state(&temp), Some(WidgetSyncState::FlushPending));
    assert!(state.is_in_flight(&temp));
    assert_eq!(state.flushes_started(), 1);

    // Edit while in flight
    state
      .queue_mut()
      .enqueue(SyncOperation::update(temp.clone(), WidgetPatch::title("x")));
    assert_eq!(state.sync_state(&temp), Some(WidgetSyncState::FlushPending));

    let mut result = BatchWriteResult::default();
    result.created_ids.insert(temp.clone(), durable.clone());
    state.complete_flush(&result);

    assert_eq!(state.sync_state(&durable), Some(WidgetSyncState::LocalDirty));
    // The old id still resolves
    assert_eq!(state.find(&temp).unwrap().id, durable);

    state.begin_flush().unwrap();
    state.complete_flush(&BatchWriteResult::default());
    assert_eq!(state.sync_state(&durable), Some(WidgetSyncState::Durable));
    assert!(!state.is_in_flight(&temp));
    assert_eq!(state.flushes_started(), 2);
  }

  #[test]
  fn test_abort_flush_requeues() {
    let temp = WidgetId::temporary();
    let mut state = DashboardState::new("d1", vec![widget(temp.clone())]);
    state.queue_mut().enqueue(SyncOperation::create(widget(temp.clone())));

    let drained = state.begin_flush().unwrap();
    state.abort_flush(drained);
    assert_eq!(state.queue().len(), 1);
    assert_eq!(state.sync_state(&temp), Some(WidgetSyncState::LocalOnly));
  }

  #[test]
  fn test_begin_flush_on_empty_queue() {
    let mut state = DashboardState::new("d1", Vec::new());
    assert!(state.begin_flush().is_none());
    assert_eq!(state.flushes_started(), 0);
  }

  #[test]
  fn test_notification_reaches_listeners() {
    let seen = Arc::new(AtomicUsize::new(0));
    let mut state = DashboardState::new("d1", vec![widget(WidgetId::new("1"))]);
    let counter = seen.clone();
    state.add_listener(Arc::new(move |widgets: &[Widget]| {
      counter.store(widgets.len(), Ordering::SeqCst);
    }));

    state.notification().send();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
  }
}
