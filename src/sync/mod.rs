//! Remote state synchronization.
//!
//! - `guard.rs` - generation counter that neutralizes superseded async work
//! - `poller.rs` - fixed-interval pollers mirroring server state into local snapshots

mod guard;
mod poller;

pub use guard::{StaleGuard, Token};
pub use poller::{
  FetchFn, FetchFuture, PollHandle, PollStats, PollTarget, Snapshot, TargetedPoller,
};
