//! Step, epoch and run records, logged and written as json lines.

use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;
use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Train,
    Validation,
}

/// One training step of one rank.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step_time_secs: f64,
    /// 1-based.
    pub epoch: usize,
    /// 1-based.
    pub step: usize,
    pub num_steps: usize,
    /// Running averages over the epoch so far.
    pub loss: f32,
    pub top1: f32,
    pub top5: f32,
    /// Reductions issued so far in the epoch.
    pub communications: u64,
    /// Running mean of the loss dispersion of the epoch's rounds.
    pub std_loss: f32,
    /// Every rank's loss in the last round.
    pub losses: Vec<f32>,
}

/// A whole epoch, with train metrics averaged over every rank.
#[derive(Debug, Clone, Serialize)]
pub struct EpochRecord {
    pub phase: Phase,
    pub epoch_time_secs: f64,
    pub epoch: usize,
    pub num_steps: usize,
    pub loss: f32,
    pub top1: f32,
    pub top5: f32,
    pub communications: u64,
    pub std_loss: f32,
    pub losses: Vec<f32>,
}

/// A strategy's whole run on one rank.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub strategy: String,
    pub rank: usize,
    pub total_secs: f64,
    pub train_secs: f64,
    pub reduce_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record<'a> {
    Step(&'a StepRecord),
    Epoch(&'a EpochRecord),
    Summary(&'a RunSummary),
}

impl Record<'_> {
    /// Logs the record, steps at debug level.
    pub fn log(&self, strategy: &str, rank: usize) {
        match self {
            Record::Step(r) => debug!(
                strategy = strategy, rank = rank, epoch = r.epoch, step = r.step,
                num_steps = r.num_steps, step_time = r.step_time_secs, loss = r.loss,
                top1 = r.top1, top5 = r.top5, share = r.communications, std_loss = r.std_loss;
                "step {:?}", r.losses
            ),
            Record::Epoch(r) => info!(
                strategy = strategy, rank = rank, phase = format!("{:?}", r.phase).as_str(),
                epoch = r.epoch, epoch_time = r.epoch_time_secs, loss = r.loss,
                top1 = r.top1, top5 = r.top5, share = r.communications, std_loss = r.std_loss;
                "epoch {:?}", r.losses
            ),
            Record::Summary(r) => info!(
                strategy = strategy, rank = rank, total_time = r.total_secs,
                train_time = r.train_secs, reduce_count = r.reduce_count;
                "finish"
            ),
        }
    }
}

/// Appends records to `<dir>/<strategy>_<rank>.log`, one json object per line.
#[derive(Debug)]
pub struct RecordSink {
    strategy: String,
    rank: usize,
    file: Option<BufWriter<File>>,
}

impl RecordSink {
    /// Creates the record file, and `dir` if needed.
    pub async fn create(dir: &Path, strategy: &str, rank: usize) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        let path = Self::path(dir, strategy, rank);
        let file = File::create(&path).await?;

        debug!(path = path.display().to_string().as_str(); "writing records");
        Ok(Self {
            strategy: strategy.to_string(),
            rank,
            file: Some(BufWriter::new(file)),
        })
    }

    /// A sink that only logs.
    pub fn disabled(strategy: &str, rank: usize) -> Self {
        Self {
            strategy: strategy.to_string(),
            rank,
            file: None,
        }
    }

    pub fn path(dir: &Path, strategy: &str, rank: usize) -> PathBuf {
        dir.join(format!("{strategy}_{rank}.log"))
    }

    pub async fn write(&mut self, record: Record<'_>) -> Result<()> {
        record.log(&self.strategy, self.rank);

        if let Some(file) = &mut self.file {
            let mut line = serde_json::to_vec(&record).map_err(std::io::Error::from)?;
            line.push(b'\n');
            file.write_all(&line).await?;
        }

        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        if let Some(file) = &mut self.file {
            file.flush().await?;
        }

        Ok(())
    }
}
