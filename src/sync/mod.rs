//! Sync engine: mutation queue, reconciliation state and the batch writer.
//!
//! Local edits land in `DashboardState` immediately and are recorded in the
//! `MutationQueue`. The `BatchWriter` task drains the queue after a quiet
//! period and sends one `WriteBatch` to the durable store. On success
//! temporary ids are swapped for durable ones; on failure the batch goes back
//! on the queue.

mod queue;
mod retry;
mod state;
mod writer;

pub use queue::{Drained, Intent, MutationQueue, OpKind, SyncOperation};
pub use retry::RetryPolicy;
pub use state::{lock, DashboardState, Listener, Notification, SharedState, WidgetSyncState};
pub use writer::{BatchWriter, FlushOutcome, SaveStatus, WriterHandle};
