//! Client-side dashboard: optimistic widget store and cached reads.

mod client;
mod layout;
mod session;
mod store;

pub use client::CachedDashboardClient;
pub use layout::{Layout, StackLayout};
pub use session::{DashboardSession, SessionOptions};
pub use store::{PositionChange, WidgetStore};
