//! Subscriptions to store events.
//!
//! Subscribers receive a notification after every successful mutation:
//! snapshot puts, write batches, deletions, branches, cleanup passes and
//! clears. Each subscriber has a bounded buffer; a subscriber that falls
//! behind is dropped rather than blocking the store.
//!
//! # Example
//!
//! ```ignore
//! let handle = store.subscribe(SubscriptionConfig {
//!     filter: SubscriptionFilter::thread("thread-1"),
//!     ..Default::default()
//! });
//!
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         StoreEvent::SnapshotPut { address, .. } => println!("new snapshot {}", address),
//!         StoreEvent::Dropped { .. } => break,
//!         _ => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
