use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use clap::Parser;
use machine_learning::dataset::BlobSpec;

use crate::{Result, TrainErr, strategy::Strategy};

/// Trains a classifier over a group of ranks and compares how they synchronize gradients.
#[derive(Parser, Debug, Clone)]
#[command(name = "worker", version)]
pub struct Cli {
    /// This process' rank, ignored with `--local`.
    pub rank: usize,

    /// The amount of ranks.
    pub world: usize,

    /// Samples per step over every rank, each rank takes `batch / world` of them.
    #[arg(long, default_value_t = 256)]
    pub batch: usize,

    #[arg(long, default_value_t = 30)]
    pub epochs: usize,

    #[arg(long, default_value_t = 0.01)]
    pub lr: f32,

    /// `blobs` or `blobs-small`.
    #[arg(long, default_value = "blobs")]
    pub dataset: String,

    /// Run a single strategy: eager, periodic or async-overlap (or minibatch, local,
    /// proposal). Every strategy the world size allows is run back to back otherwise.
    #[arg(long, alias = "train-type")]
    pub strategy: Option<String>,

    #[arg(long, default_value_t = 0.9)]
    pub momentum: f32,

    #[arg(long, default_value_t = 0.05)]
    pub weight_decay: f32,

    /// The communication period of periodic and async-overlap.
    #[arg(short, long, default_value_t = 5, allow_negative_numbers = true)]
    pub k: i64,

    /// The rendezvous address, rank 0 listens on it.
    #[arg(long, default_value = "127.0.0.1:7548")]
    pub ip: String,

    /// Hidden layer sizes of the classifier.
    #[arg(long, value_delimiter = ',', default_value = "64")]
    pub hidden: Vec<usize>,

    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Base seed for data shuffling and model initialization.
    #[arg(long, default_value_t = 7548)]
    pub seed: u64,

    /// Seconds to keep trying to reach rank 0.
    #[arg(long, default_value_t = 60)]
    pub connect_timeout: u64,

    /// Run every rank inside this process.
    #[arg(long)]
    pub local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    /// Every rank runs in this process over in-memory streams.
    Local,
}

/// A validated run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub rank: usize,
    pub world_size: NonZeroUsize,
    /// Samples per step on each rank.
    pub batch_size: NonZeroUsize,
    pub epochs: usize,
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub dataset: String,
    pub hidden: Vec<usize>,
    /// Run in order, each over its own process group.
    pub strategies: Vec<Strategy>,
    pub addr: String,
    /// Where record files go, `None` to only log.
    pub log_dir: Option<PathBuf>,
    pub seed: u64,
    pub connect_timeout: Duration,
    pub transport: Transport,
}

impl TryFrom<Cli> for RunConfig {
    type Error = TrainErr;

    fn try_from(cli: Cli) -> Result<Self> {
        let invalid = |msg: String| Err(TrainErr::Configuration(msg));

        let Some(world_size) = NonZeroUsize::new(cli.world) else {
            return invalid("the world size must be at least 1".to_string());
        };

        let transport = if cli.local {
            Transport::Local
        } else {
            Transport::Tcp
        };
        if transport == Transport::Tcp && cli.rank >= cli.world {
            return invalid(format!("rank {} out of a world of {}", cli.rank, cli.world));
        }

        let Some(batch_size) = NonZeroUsize::new(cli.batch / cli.world) else {
            return invalid(format!(
                "a batch of {} can't be split over {} ranks",
                cli.batch, cli.world
            ));
        };

        if cli.epochs == 0 {
            return invalid("at least one epoch is needed".to_string());
        }

        if !(cli.lr.is_finite() && cli.lr > 0.0) {
            return invalid(format!("the learning rate must be positive, got {}", cli.lr));
        }

        if !(0.0..1.0).contains(&cli.momentum) {
            return invalid(format!("the momentum must be in [0, 1), got {}", cli.momentum));
        }

        if !(cli.weight_decay.is_finite() && cli.weight_decay >= 0.0) {
            return invalid(format!(
                "the weight decay can't be negative, got {}",
                cli.weight_decay
            ));
        }

        if cli.hidden.contains(&0) {
            return invalid("hidden layers need at least one unit".to_string());
        }

        let blobs =
            BlobSpec::named(&cli.dataset).map_err(|e| TrainErr::Configuration(e.to_string()))?;
        if blobs.train < cli.world {
            return invalid(format!(
                "{} training samples can't be split over {} ranks",
                blobs.train, cli.world
            ));
        }

        let strategies = match &cli.strategy {
            Some(name) => vec![Strategy::from_name(name, cli.k)?],
            None => Strategy::all(world_size, cli.k)?,
        };

        Ok(Self {
            rank: cli.rank,
            world_size,
            batch_size,
            epochs: cli.epochs,
            learning_rate: cli.lr,
            momentum: cli.momentum,
            weight_decay: cli.weight_decay,
            dataset: cli.dataset,
            hidden: cli.hidden,
            strategies,
            addr: cli.ip,
            log_dir: Some(cli.log_dir),
            seed: cli.seed,
            connect_timeout: Duration::from_secs(cli.connect_timeout),
            transport,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<RunConfig> {
        let cli = Cli::try_parse_from(["worker"].iter().chain(args)).unwrap();
        RunConfig::try_from(cli)
    }

    #[test]
    fn defaults() {
        let cfg = parse(&["1", "4"]).unwrap();

        assert_eq!(cfg.rank, 1);
        assert_eq!(cfg.world_size.get(), 4);
        assert_eq!(cfg.batch_size.get(), 64);
        assert_eq!(cfg.transport, Transport::Tcp);
        assert_eq!(cfg.strategies.len(), 3);
        assert_eq!(cfg.hidden, [64]);
    }

    #[test]
    fn single_strategy() {
        let cfg = parse(&["0", "2", "--train-type", "local", "-k", "3"]).unwrap();
        assert_eq!(cfg.strategies, [Strategy::Periodic { k: NonZeroUsize::new(3).unwrap() }]);
    }

    #[test]
    fn bad_periods_are_refused_before_training() {
        for k in ["0", "-3"] {
            assert!(matches!(
                parse(&["0", "2", "--strategy", "async-overlap", "-k", k]),
                Err(TrainErr::Configuration(_))
            ));
        }
    }

    #[test]
    fn bad_worlds_are_refused() {
        assert!(matches!(parse(&["0", "0"]), Err(TrainErr::Configuration(_))));
        assert!(matches!(parse(&["2", "2"]), Err(TrainErr::Configuration(_))));
        assert!(matches!(
            parse(&["0", "4", "--batch", "2"]),
            Err(TrainErr::Configuration(_))
        ));
        assert!(parse(&["7", "2", "--local"]).is_ok());
    }

    #[test]
    fn unknown_datasets_are_refused() {
        assert!(matches!(
            parse(&["0", "1", "--dataset", "cifar100"]),
            Err(TrainErr::Configuration(_))
        ));
    }
}
