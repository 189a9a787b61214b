use std::io;

use collective::CollectiveErr;
use machine_learning::MlErr;
use thiserror::Error;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training runtime failures.
#[derive(Debug, Error)]
pub enum TrainErr {
    /// A collective failed, a peer is gone or the hub gave up on the group.
    #[error("communication failed: {0}")]
    Communication(#[source] CollectiveErr),

    /// The gradients don't follow the layout every rank agreed on.
    #[error("gradient shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An empty accumulator was averaged.
    #[error("cannot average an accumulator without samples")]
    DivisionByZero,

    /// The ranks issued different collectives.
    #[error("ranks fell out of step: {0}")]
    Desync(String),

    #[error("model failure: {0}")]
    Ml(#[from] MlErr),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<CollectiveErr> for TrainErr {
    fn from(err: CollectiveErr) -> Self {
        match err {
            CollectiveErr::ShapeMismatch { .. } => Self::ShapeMismatch(err.to_string()),
            CollectiveErr::Desync { .. } => Self::Desync(err.to_string()),
            other => Self::Communication(other),
        }
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
