//! Collective operations for a group of ranks served by a hub on rank 0.
//!
//! Every collective is a round: each rank sends its contribution to the hub, the hub
//! validates that all of them agree on the operation and its length, combines them in
//! rank order and answers every rank with the same result.

mod error;
mod group;
mod handle;
mod hub;
pub mod rendezvous;

pub use error::{CollectiveErr, Result};
pub use group::ProcessGroup;
pub use handle::CollectiveHandle;
pub use hub::Hub;
