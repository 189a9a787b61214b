use std::{fmt, num::NonZeroUsize};

use crate::{Result, TrainErr};

/// How and when the ranks combine their gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Average the gradients across every rank on every step.
    Eager,
    /// Train locally, averaging the gradients every `k` steps.
    Periodic { k: NonZeroUsize },
    /// Every `k` steps start a non-blocking reduction of the local gradients and blend in
    /// the result of the previous one.
    AsyncOverlap { k: NonZeroUsize },
}

impl Strategy {
    /// Builds a strategy out of its command line name.
    ///
    /// # Arguments
    /// * `name` - `eager`, `periodic` or `async-overlap`, or their aliases
    ///   `minibatch`, `local` and `proposal`.
    /// * `k` - The communication period, ignored by `eager`.
    ///
    /// # Errors
    /// `Configuration` for unknown names or a non positive period.
    pub fn from_name(name: &str, k: i64) -> Result<Self> {
        let period = || {
            usize::try_from(k)
                .ok()
                .and_then(NonZeroUsize::new)
                .ok_or_else(|| {
                    TrainErr::Configuration(format!("{name} needs a positive period, got k = {k}"))
                })
        };

        match name {
            "eager" | "minibatch" => Ok(Self::Eager),
            "periodic" | "local" => Ok(Self::Periodic { k: period()? }),
            "async-overlap" | "async_overlap" | "proposal" => {
                Ok(Self::AsyncOverlap { k: period()? })
            }
            other => Err(TrainErr::Configuration(format!(
                "unknown strategy {other}, expected eager, periodic or async-overlap"
            ))),
        }
    }

    /// Every strategy worth running for `world_size` ranks, in the order they are run.
    ///
    /// A single rank has nobody to synchronize with, only `eager` is run then.
    pub fn all(world_size: NonZeroUsize, k: i64) -> Result<Vec<Self>> {
        if world_size.get() == 1 {
            return Ok(vec![Self::Eager]);
        }

        ["eager", "periodic", "async-overlap"]
            .into_iter()
            .map(|name| Self::from_name(name, k))
            .collect()
    }

    /// A file name friendly identifier.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Eager => "eager",
            Self::Periodic { .. } => "periodic",
            Self::AsyncOverlap { .. } => "async-overlap",
        }
    }

    /// Returns true if the strategy issues a collective at `step`, counted from 0 within
    /// the epoch.
    #[inline]
    pub fn communicates_at(&self, step: usize) -> bool {
        match self {
            Self::Eager => true,
            Self::Periodic { k } => step > 0 && step % k.get() == 0,
            Self::AsyncOverlap { k } => step % k.get() == 0,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eager => write!(f, "eager"),
            Self::Periodic { k } => write!(f, "periodic(k={k})"),
            Self::AsyncOverlap { k } => write!(f, "async-overlap(k={k})"),
        }
    }
}
