//! Data parallel training over a process group, comparing when and how the ranks
//! combine their gradients.

pub mod bootstrap;
pub mod config;
pub mod dispersion;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod report;
pub mod strategy;
pub mod sync;

pub use config::{Cli, RunConfig, Transport};
pub use driver::{Datasets, EpochDriver, Learner};
pub use error::{Result, TrainErr};
pub use strategy::Strategy;
pub use sync::{OverlapBuffers, Synchronizer};
