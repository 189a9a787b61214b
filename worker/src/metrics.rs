use std::time::Duration;

use collective::ProcessGroup;

use crate::{Result, TrainErr};

/// A running weighted mean.
///
/// Totals are kept in `f64` and only narrowed to `f32` when read out or sent.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Accumulator {
    sum: f64,
    count: f64,
}

impl Accumulator {
    #[inline]
    pub fn update(&mut self, value: f32, weight: f32) {
        self.sum += f64::from(value) * f64::from(weight);
        self.count += f64::from(weight);
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> f64 {
        self.count
    }

    /// The mean of every value so far, an error if nothing was added yet.
    pub fn average(&self) -> Result<f32> {
        if self.count == 0.0 {
            return Err(TrainErr::DivisionByZero);
        }

        Ok((self.sum / self.count) as f32)
    }
}

/// The accumulators of a train or validation epoch.
#[derive(Debug, Default, Clone)]
pub struct EpochMeters {
    pub loss: Accumulator,
    pub top1: Accumulator,
    pub top5: Accumulator,
}

impl EpochMeters {
    /// Adds a batch of `samples` samples.
    pub fn update(&mut self, loss: f32, top1: f32, top5: f32, samples: usize) {
        let weight = samples as f32;
        self.loss.update(loss, weight);
        self.top1.update(top1, weight);
        self.top5.update(top5, weight);
    }

    /// The local averages of loss, top-1 and top-5, in that order.
    pub fn averages(&self) -> Result<[f32; 3]> {
        Ok([
            self.loss.average()?,
            self.top1.average()?,
            self.top5.average()?,
        ])
    }

    /// The averages of loss, top-1 and top-5 over every rank.
    pub async fn reduce(&self, group: &mut ProcessGroup) -> Result<[f32; 3]> {
        let averages = reduce_across_workers(group, &[&self.loss, &self.top1, &self.top5]).await?;
        match averages[..] {
            [loss, top1, top5] => Ok([loss, top1, top5]),
            _ => Err(TrainErr::ShapeMismatch(format!(
                "reduced {} averages out of 3 meters",
                averages.len()
            ))),
        }
    }
}

/// Averages every accumulator over every rank.
///
/// Every rank's `(sum, count)` pairs are summed in one blocking reduction and each rank
/// divides the totals itself, so the result is the exact global mean no matter how the
/// samples were split. This is a collective, every rank must pass the same amount of
/// accumulators. A single rank averages locally.
///
/// # Returns
/// The global average of every accumulator, in order.
pub async fn reduce_across_workers(
    group: &mut ProcessGroup,
    accumulators: &[&Accumulator],
) -> Result<Vec<f32>> {
    if group.world_size() == 1 {
        return accumulators.iter().map(|acc| acc.average()).collect();
    }

    let packed = accumulators
        .iter()
        .flat_map(|acc| [acc.sum as f32, acc.count as f32])
        .collect();
    let totals = group.all_reduce_sum(packed).await?;

    totals
        .chunks_exact(2)
        .map(|pair| {
            Accumulator {
                sum: f64::from(pair[0]),
                count: f64::from(pair[1]),
            }
            .average()
        })
        .collect()
}

/// Wall clock totals of a strategy's run.
#[derive(Debug, Default, Clone)]
pub struct RunTimes {
    /// Training and validation.
    pub total: Duration,
    pub train: Duration,
    pub epochs: u64,
}
