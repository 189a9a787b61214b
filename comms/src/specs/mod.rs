//! Wire-level specifications exchanged while a process group is formed.

mod peer;

pub use peer::PeerSpec;
