//! Client-side synchronization of Atelier thread messages.
//!
//! Keeps an ordered, deduplicated local copy of each open thread consistent
//! with backward history pages, a live change feed and the user's own
//! optimistic writes.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod lane;
pub mod ledger;
pub mod loader;
pub mod mutation;
pub mod registry;
pub mod remote;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use backend::{FeedStream, ThreadBackend};
pub use client::{SyncClient, ThreadView};
pub use config::{Identity, SyncConfig};
pub use error::{BackendError, BackendErrorKind, SyncError};
pub use lane::StoreChange;
pub use mutation::{MutationKind, MutationState, PendingMutation};
pub use registry::{SessionRegistry, ThreadHandle};
pub use remote::HttpBackend;
pub use session::ThreadSession;
pub use store::{MergeResult, MessageStore, Snapshot};
