use std::io;

use comms::msg::Abort;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollectiveErr {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("rank {rank} left the group in the middle of a collective")]
    PeerLost { rank: usize },

    #[error("rank {rank} contributed {got} values to {op}, expected {expected}")]
    ShapeMismatch {
        op: String,
        rank: usize,
        got: usize,
        expected: usize,
    },

    #[error("rank {rank} issued {got} while the group expected {expected}")]
    Desync {
        rank: usize,
        expected: String,
        got: String,
    },

    #[error("the hub reported an error: {0}")]
    Remote(String),

    #[error("unexpected message: {0}")]
    Protocol(String),

    #[error("rendezvous failed: {0}")]
    Rendezvous(String),

    #[error("the group was aborted by an earlier failure: {0}")]
    Aborted(String),

    #[error("the process group connection is closed")]
    Closed,
}

impl From<Abort> for CollectiveErr {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::PeerLost { rank } => Self::PeerLost { rank },
            Abort::ShapeMismatch {
                op,
                rank,
                got,
                expected,
            } => Self::ShapeMismatch {
                op,
                rank,
                got,
                expected,
            },
            Abort::Desync {
                rank,
                expected,
                got,
            } => Self::Desync {
                rank,
                expected,
                got,
            },
            Abort::Rejected { reason } => Self::Rendezvous(reason),
        }
    }
}

pub type Result<T> = std::result::Result<T, CollectiveErr>;
