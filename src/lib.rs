//! Keeps a local copy of Unleash feature toggle definitions in sync with the server.
//!
//! A [SyncController] restores its first [Dataset] from a backup file or a bootstrap payload,
//! then polls the server with conditional requests, backing off when the server struggles.
//! Datasets are immutable snapshots; readers keep theirs while refreshes publish new ones.

mod backup;
mod bucket;
mod config;
mod constraint;
mod context;
mod controller;
mod dataset;
mod error;
mod event;
mod fetch;
mod flag;
mod registry;
mod scheduler;
mod segment;
mod store;
mod test_common;
mod throttle;
mod util;
mod variant;

pub use backup::*;
pub use bucket::*;
pub use config::*;
pub use constraint::*;
pub use context::*;
pub use controller::*;
pub use dataset::*;
pub use error::*;
pub use event::*;
pub use fetch::*;
pub use flag::*;
pub use registry::*;
pub use scheduler::*;
pub use segment::*;
pub use store::*;
pub use throttle::*;
pub use variant::*;
