//! Forking a thread from another thread's snapshot.
//!
//! A branch copies one source snapshot into a fresh thread as its sole,
//! parentless snapshot, and records where it came from in the metadata.

mod fork;

pub use fork::{fork_metadata, BranchOutcome, BranchRequest, BRANCH_SOURCE, FORK_SOURCE};
