//! Pending widget operations, coalesced per widget id.
//!
//! The queue holds at most one operation per id, so "create XOR update XOR
//! delete" is structural. Coalescing rules, older op first:
//!
//! | older \ newer | create    | update          | reposition      | delete      |
//! |---------------|-----------|-----------------|-----------------|-------------|
//! | create        | newer     | amended create  | amended create  | (cancelled) |
//! | update        | newer     | merged update   | merged update   | delete      |
//! | reposition    | newer     | merged update   | newer           | delete      |
//! | delete        | newer     | delete          | delete          | delete      |

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::db::{WidgetUpdate, WriteBatch};
use crate::widget::{Position, Widget, WidgetId, WidgetPatch};

/// What a pending operation wants to happen.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
  Create(Box<Widget>),
  Update(WidgetPatch),
  Reposition(Position),
  Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
  Create,
  Update,
  Reposition,
  Delete,
}

/// A pending intent for one widget.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperation {
  pub widget_id: WidgetId,
  pub intent: Intent,
  pub enqueued_at: DateTime<Utc>,
  /// Ordering within a batch; kept from the oldest merged operation
  seq: u64,
}

impl SyncOperation {
  pub fn create(widget: Widget) -> Self {
    Self::new(widget.id.clone(), Intent::Create(Box::new(widget)))
  }

  pub fn update(widget_id: WidgetId, patch: WidgetPatch) -> Self {
    Self::new(widget_id, Intent::Update(patch))
  }

  pub fn reposition(widget_id: WidgetId, position: Position) -> Self {
    Self::new(widget_id, Intent::Reposition(position))
  }

  pub fn delete(widget_id: WidgetId) -> Self {
    Self::new(widget_id, Intent::Delete)
  }

  fn new(widget_id: WidgetId, intent: Intent) -> Self {
    Self {
      widget_id,
      intent,
      enqueued_at: Utc::now(),
      seq: 0,
    }
  }

  pub fn kind(&self) -> OpKind {
    match self.intent {
      Intent::Create(_) => OpKind::Create,
      Intent::Update(_) => OpKind::Update,
      Intent::Reposition(_) => OpKind::Reposition,
      Intent::Delete => OpKind::Delete,
    }
  }
}

/// Fold `newer` on top of `older` for the same widget id.
///
/// Returns `None` when the two cancel out (create followed by delete).
fn coalesce(older: SyncOperation, newer: SyncOperation) -> Option<SyncOperation> {
  let now = newer.enqueued_at;
  let intent = match (older.intent, newer.intent) {
    (Intent::Create(_), Intent::Delete) => return None,
    (_, Intent::Create(widget)) => Intent::Create(widget),
    (Intent::Create(mut widget), Intent::Update(patch)) => {
      widget.apply(&patch, now);
      Intent::Create(widget)
    }
    (Intent::Create(mut widget), Intent::Reposition(position)) => {
      widget.position = position;
      Intent::Create(widget)
    }
    (Intent::Update(mut patch), Intent::Update(newer_patch)) => {
      patch.merge(newer_patch);
      Intent::Update(patch)
    }
    (Intent::Update(mut patch), Intent::Reposition(position)) => {
      patch.position = Some(position);
      Intent::Update(patch)
    }
    (Intent::Reposition(position), Intent::Update(newer_patch)) => {
      let mut patch = WidgetPatch::position(position);
      patch.merge(newer_patch);
      Intent::Update(patch)
    }
    (Intent::Reposition(_), Intent::Reposition(position)) => Intent::Reposition(position),
    (Intent::Delete, Intent::Update(_) | Intent::Reposition(_)) => {
      // The widget is gone from the store, nothing can follow a delete
      debug!(widget_id = %older.widget_id, "ignoring edit queued after delete");
      Intent::Delete
    }
    (_, Intent::Delete) => Intent::Delete,
  };

  Some(SyncOperation {
    widget_id: older.widget_id,
    intent,
    enqueued_at: now,
    seq: older.seq,
  })
}

/// Snapshot taken out of the queue for one flush attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Drained {
  pub creates: Vec<SyncOperation>,
  /// Updates and repositions
  pub updates: Vec<SyncOperation>,
  pub deletes: Vec<SyncOperation>,
}

impl Drained {
  pub fn is_empty(&self) -> bool {
    self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
  }

  pub fn len(&self) -> usize {
    self.creates.len() + self.updates.len() + self.deletes.len()
  }

  pub fn widget_ids(&self) -> impl Iterator<Item = &WidgetId> {
    self
      .creates
      .iter()
      .chain(&self.updates)
      .chain(&self.deletes)
      .map(|op| &op.widget_id)
  }

  /// The request body sent to the durable store.
  pub fn to_write_batch(&self) -> WriteBatch {
    let mut batch = WriteBatch::default();
    for op in self.creates.iter().chain(&self.updates).chain(&self.deletes) {
      match &op.intent {
        Intent::Create(widget) => batch.creates.push(widget.as_ref().clone()),
        Intent::Update(patch) => batch.updates.push(WidgetUpdate {
          id: op.widget_id.clone(),
          patch: patch.clone(),
        }),
        Intent::Reposition(position) => batch.updates.push(WidgetUpdate {
          id: op.widget_id.clone(),
          patch: WidgetPatch::position(*position),
        }),
        Intent::Delete => batch.deletes.push(op.widget_id.clone()),
      }
    }
    batch
  }

  fn into_ops(self) -> impl Iterator<Item = SyncOperation> {
    self
      .creates
      .into_iter()
      .chain(self.updates)
      .chain(self.deletes)
  }
}

/// Pending operations plus the network reachability flag.
#[derive(Debug)]
pub struct MutationQueue {
  pending: HashMap<WidgetId, SyncOperation>,
  next_seq: u64,
  reachable: bool,
}

impl Default for MutationQueue {
  fn default() -> Self {
    Self {
      pending: HashMap::new(),
      next_seq: 0,
      reachable: true,
    }
  }
}

impl MutationQueue {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record an operation, coalescing with whatever is pending for its id.
  pub fn enqueue(&mut self, mut op: SyncOperation) {
    op.seq = self.next_seq;
    self.next_seq += 1;

    let id = op.widget_id.clone();
    let merged = match self.pending.remove(&id) {
      Some(existing) => coalesce(existing, op),
      None => Some(op),
    };

    match merged {
      Some(op) => {
        debug!(widget_id = %id, kind = ?op.kind(), "queued");
        self.pending.insert(id, op);
      }
      None => debug!(widget_id = %id, "create cancelled by delete"),
    }
  }

  /// Take every pending operation, leaving the queue empty.
  pub fn drain(&mut self) -> Drained {
    let mut ops: Vec<SyncOperation> = self.pending.drain().map(|(_, op)| op).collect();
    ops.sort_by_key(|op| op.seq);

    let mut drained = Drained::default();
    for op in ops {
      match op.kind() {
        OpKind::Create => drained.creates.push(op),
        OpKind::Update | OpKind::Reposition => drained.updates.push(op),
        OpKind::Delete => drained.deletes.push(op),
      }
    }
    drained
  }

  /// Put a failed batch back. Anything enqueued since the drain is newer
  /// and is folded on top of the requeued operation, never overwritten.
  pub fn requeue(&mut self, drained: Drained) {
    for op in drained.into_ops() {
      let id = op.widget_id.clone();
      let merged = match self.pending.remove(&id) {
        Some(newer) => {
          let seq = op.seq.min(newer.seq);
          coalesce(op, newer).map(|mut merged| {
            merged.seq = seq;
            merged
          })
        }
        None => Some(op),
      };
      if let Some(op) = merged {
        self.pending.insert(id, op);
      }
    }
  }

  /// Move a pending operation from a temporary id to its durable id.
  pub fn rekey(&mut self, from: &WidgetId, to: &WidgetId) {
    if let Some(mut op) = self.pending.remove(from) {
      op.widget_id = to.clone();
      if let Intent::Create(widget) = &mut op.intent {
        widget.id = to.clone();
      }
      self.pending.insert(to.clone(), op);
    }
  }

  pub fn get(&self, id: &WidgetId) -> Option<&SyncOperation> {
    self.pending.get(id)
  }

  pub fn has_pending_create(&self, id: &WidgetId) -> bool {
    matches!(self.pending.get(id).map(SyncOperation::kind), Some(OpKind::Create))
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  pub fn is_reachable(&self) -> bool {
    self.reachable
  }

  /// Update reachability. Returns true on an offline -> online transition.
  pub fn set_reachable(&mut self, reachable: bool) -> bool {
    let restored = reachable && !self.reachable;
    self.reachable = reachable;
    restored
  }
}
