use std::{io, num::NonZeroUsize, sync::Arc, time::Instant};

use collective::ProcessGroup;
use log::{debug, info};
use machine_learning::{
    Classifier, GradientSet, accuracy,
    arch::loss::{CrossEntropy, LossFn},
    dataset::{Batch, Dataset},
    optimization::{Optimizer, StepLr},
};
use ndarray::Array2;
use tokio::task;

use crate::{
    Result, TrainErr,
    dispersion::{self, Dispersion},
    metrics::{Accumulator, EpochMeters, RunTimes},
    report::{EpochRecord, Phase, Record, RecordSink, RunSummary, StepRecord},
    strategy::Strategy,
    sync::{OverlapBuffers, Synchronizer},
};

/// A model and its optimizer, moved to the blocking pool for every computation.
#[derive(Debug)]
pub struct Learner<M, O> {
    pub model: M,
    pub optimizer: O,
    loss_fn: CrossEntropy,
}

struct StepOutput {
    grads: GradientSet,
    loss: f32,
    top1: f32,
    top5: f32,
}

impl<M: Classifier, O: Optimizer> Learner<M, O> {
    pub fn new(model: M, optimizer: O) -> Self {
        Self {
            model,
            optimizer,
            loss_fn: CrossEntropy::new(),
        }
    }

    fn compute(&mut self, batch: &Batch) -> Result<StepOutput> {
        let logits = self.model.forward(batch.inputs.view())?;
        let loss = self.loss_fn.loss(logits.view(), &batch.labels)?;
        let [top1, top5] = top_1_5(&logits, &batch.labels)?;

        let d = self.loss_fn.loss_prime(logits.view(), &batch.labels)?;
        let grads = self.model.backward(d)?;

        Ok(StepOutput {
            grads,
            loss,
            top1,
            top5,
        })
    }

    fn evaluate(&mut self, batch: &Batch) -> Result<[f32; 3]> {
        let logits = self.model.forward(batch.inputs.view())?;
        let loss = self.loss_fn.loss(logits.view(), &batch.labels)?;
        let [top1, top5] = top_1_5(&logits, &batch.labels)?;

        Ok([loss, top1, top5])
    }

    fn apply(&mut self, grads: &GradientSet) -> Result<()> {
        self.optimizer.step(self.model.params_mut(), grads)?;
        Ok(())
    }
}

const COUNT_HALF_BITS: u32 = 24;

/// Splits `n` into two halves that `f32` holds exactly.
fn split_count(n: u64) -> [f32; 2] {
    let mask = (1 << COUNT_HALF_BITS) - 1;
    [(n >> COUNT_HALF_BITS) as f32, (n & mask) as f32]
}

fn join_count([high, low]: [f32; 2]) -> u64 {
    ((high as u64) << COUNT_HALF_BITS) | low as u64
}

fn top_1_5(logits: &Array2<f32>, labels: &[usize]) -> Result<[f32; 2]> {
    match accuracy::top_k(logits.view(), labels, &[1, 5])?[..] {
        [top1, top5] => Ok([top1, top5]),
        _ => Err(TrainErr::ShapeMismatch("expected two accuracies".to_string())),
    }
}

/// Synchronizes one step's gradients and, on communicating steps, measures the loss dispersion.
///
/// The losses are gathered before the gradients reach the synchronizer, so the step never
/// waits on a reduction the async-overlap strategy left in flight.
async fn exchange(
    group: &mut ProcessGroup,
    sync: &mut Synchronizer,
    step: usize,
    loss: f32,
    grads: GradientSet,
    buffers: OverlapBuffers,
) -> Result<(GradientSet, OverlapBuffers, Option<Dispersion>)> {
    let round = if sync.communicates_at(step) {
        Some(dispersion::measure(group, loss).await?)
    } else {
        None
    };

    let (grads, buffers) = sync.synchronize(group, step, grads, buffers).await?;
    Ok((grads, buffers, round))
}

/// The datasets every rank draws its batches from.
#[derive(Debug, Clone)]
pub struct Datasets {
    pub train: Arc<Dataset>,
    pub validation: Arc<Dataset>,
}

/// Runs the train and validation epochs of one strategy on one rank.
///
/// Every rank of the group must run the same amount of epochs over equally sized shards,
/// so that every rank issues the same collectives in the same order. Shards are cut by
/// `Dataset::shard`, which drops the remainder to keep them equal.
pub struct EpochDriver<M, O> {
    group: ProcessGroup,
    sync: Synchronizer,
    learner: Option<Learner<M, O>>,
    scheduler: StepLr,
    data: Datasets,
    batch_size: NonZeroUsize,
    seed: u64,
    sink: RecordSink,
}

impl<M, O> EpochDriver<M, O>
where
    M: Classifier + Send + 'static,
    O: Optimizer + Send + 'static,
{
    /// Creates a new `EpochDriver`.
    ///
    /// # Arguments
    /// * `group` - The process group, formed for `strategy`.
    /// * `strategy` - How gradients are combined.
    /// * `learner` - The model to train, initialized the same way on every rank.
    /// * `data` - The datasets.
    /// * `batch_size` - The amount of samples per step on this rank.
    /// * `seed` - The base seed, offset by the epoch.
    /// * `sink` - Where records go.
    pub fn new(
        group: ProcessGroup,
        strategy: Strategy,
        learner: Learner<M, O>,
        data: Datasets,
        batch_size: NonZeroUsize,
        seed: u64,
        sink: RecordSink,
    ) -> Result<Self> {
        let world_size = NonZeroUsize::new(group.world_size())
            .ok_or_else(|| TrainErr::Configuration("empty process group".to_string()))?;

        let sync = Synchronizer::new(strategy, world_size, learner.model.layout());
        let scheduler = StepLr::new(
            &learner.optimizer,
            StepLr::DEFAULT_STEP_SIZE,
            StepLr::DEFAULT_GAMMA,
        );

        Ok(Self {
            group,
            sync,
            learner: Some(learner),
            scheduler,
            data,
            batch_size,
            seed,
            sink,
        })
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    /// Runs `epochs` train and validation epochs, then leaves the group.
    ///
    /// # Returns
    /// The run's summary.
    pub async fn run(mut self, epochs: usize) -> Result<RunSummary> {
        let start = Instant::now();
        let mut times = RunTimes::default();
        let mut reduce_count = 0;

        for epoch in 0..epochs {
            let train_start = Instant::now();
            reduce_count += self.train_epoch(epoch).await?;
            times.train += train_start.elapsed();

            self.validate_epoch(epoch).await?;
            self.step_scheduler();
            times.epochs += 1;
        }
        times.total = start.elapsed();

        let summary = RunSummary {
            strategy: self.sync.strategy().to_string(),
            rank: self.group.rank(),
            total_secs: times.total.as_secs_f64(),
            train_secs: times.train.as_secs_f64(),
            reduce_count,
        };
        self.sink.write(Record::Summary(&summary)).await?;
        self.sink.flush().await?;

        self.group.shutdown().await?;
        Ok(summary)
    }

    /// Trains over this rank's shard of the training set once.
    ///
    /// # Returns
    /// The amount of reductions issued during the epoch.
    pub async fn train_epoch(&mut self, epoch: usize) -> Result<u64> {
        let start = Instant::now();
        let rank = self.group.rank();
        let world_size = NonZeroUsize::new(self.group.world_size())
            .ok_or_else(|| TrainErr::Configuration("empty process group".to_string()))?;

        let data = Arc::clone(&self.data.train);
        let indices = data.shard(self.seed + epoch as u64, rank, world_size);
        let num_steps = indices.len().div_ceil(self.batch_size.get());

        info!(
            rank = rank, epoch = epoch + 1, num_steps = num_steps,
            lr = self.learning_rate();
            "training"
        );

        let communications_before = self.sync.counters().communications;
        let mut meters = EpochMeters::default();
        let mut std_loss = Accumulator::default();
        let mut losses = Vec::new();
        let mut buffers = OverlapBuffers::default();

        for (step, batch) in data.batches(&indices, self.batch_size).enumerate() {
            let step_start = Instant::now();
            let samples = batch.len();

            let out = self.blocking(move |learner| learner.compute(&batch)).await?;
            meters.update(out.loss, out.top1, out.top5, samples);

            let (grads, next, round) = exchange(
                &mut self.group,
                &mut self.sync,
                step,
                out.loss,
                out.grads,
                buffers,
            )
            .await?;
            buffers = next;

            if let Some(round) = round {
                std_loss.update(round.std_dev, 1.0);
                losses = round.losses;
            }

            self.blocking(move |learner| learner.apply(&grads)).await?;

            let [loss, top1, top5] = meters.averages()?;
            let record = StepRecord {
                step_time_secs: step_start.elapsed().as_secs_f64(),
                epoch: epoch + 1,
                step: step + 1,
                num_steps,
                loss,
                top1,
                top5,
                communications: self.sync.counters().communications - communications_before,
                std_loss: std_loss.average().unwrap_or_default(),
                losses: losses.clone(),
            };
            self.sink.write(Record::Step(&record)).await?;
        }

        if buffers.in_flight() {
            debug!(rank = rank; "draining in flight reductions");
        }
        buffers.drain().await?;

        let [loss, top1, top5] = meters.reduce(&mut self.group).await?;
        if cfg!(debug_assertions) {
            self.check_call_counts().await?;
        }

        let communications = self.sync.counters().communications - communications_before;
        let record = EpochRecord {
            phase: Phase::Train,
            epoch_time_secs: start.elapsed().as_secs_f64(),
            epoch: epoch + 1,
            num_steps,
            loss,
            top1,
            top5,
            communications,
            std_loss: std_loss.average().unwrap_or_default(),
            losses,
        };
        self.sink.write(Record::Epoch(&record)).await?;

        Ok(communications)
    }

    /// Evaluates the model over the whole validation set, without communicating.
    pub async fn validate_epoch(&mut self, epoch: usize) -> Result<EpochRecord> {
        let start = Instant::now();

        let data = Arc::clone(&self.data.validation);
        let indices = data.shuffled(self.seed + epoch as u64);
        let num_steps = indices.len().div_ceil(self.batch_size.get());

        let mut meters = EpochMeters::default();
        for batch in data.batches(&indices, self.batch_size) {
            let samples = batch.len();
            let [loss, top1, top5] = self.blocking(move |learner| learner.evaluate(&batch)).await?;
            meters.update(loss, top1, top5, samples);
        }

        let [loss, top1, top5] = meters.averages()?;
        let record = EpochRecord {
            phase: Phase::Validation,
            epoch_time_secs: start.elapsed().as_secs_f64(),
            epoch: epoch + 1,
            num_steps,
            loss,
            top1,
            top5,
            communications: 0,
            std_loss: 0.0,
            losses: Vec::new(),
        };
        self.sink.write(Record::Epoch(&record)).await?;

        Ok(record)
    }

    pub fn learning_rate(&self) -> f32 {
        self.learner
            .as_ref()
            .map_or(0.0, |learner| learner.optimizer.learning_rate())
    }

    fn step_scheduler(&mut self) {
        if let Some(learner) = &mut self.learner {
            self.scheduler.step(&mut learner.optimizer);
        }
    }

    /// Fails with `Desync` if the ranks issued a different amount of collectives.
    async fn check_call_counts(&mut self) -> Result<()> {
        if self.group.world_size() == 1 {
            return Ok(());
        }

        let calls = self.group.calls();
        let gathered = self.group.all_gather(split_count(calls).to_vec()).await?;
        let counts: Vec<_> = gathered
            .chunks_exact(2)
            .map(|halves| join_count([halves[0], halves[1]]))
            .collect();

        match counts.iter().position(|&c| c != calls) {
            Some(other) => Err(TrainErr::Desync(format!(
                "rank {} issued {calls} collectives but rank {other} issued {}",
                self.group.rank(),
                counts[other]
            ))),
            None => Ok(()),
        }
    }

    /// Runs `f` on the blocking pool with the learner moved into it.
    async fn blocking<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Learner<M, O>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut learner = self
            .learner
            .take()
            .ok_or_else(|| io::Error::other("the learner was lost by a failed computation"))?;

        let (learner, res) = task::spawn_blocking(move || {
            let res = f(&mut learner);
            (learner, res)
        })
        .await
        .map_err(|e| io::Error::other(format!("compute join error: {e}")))?;

        self.learner = Some(learner);
        res
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use collective::rendezvous;
    use comms::specs::PeerSpec;
    use futures::future;
    use ndarray::{ArrayD, IxDyn};

    use super::*;

    fn filled(x: f32) -> GradientSet {
        GradientSet::new(vec![ArrayD::from_elem(IxDyn(&[3]), x)])
    }

    fn synchronizer(strategy: Strategy) -> Synchronizer {
        Synchronizer::new(strategy, NonZeroUsize::new(2).unwrap(), filled(0.0).layout())
    }

    fn specs(strategy: Strategy) -> Vec<PeerSpec> {
        (0..2)
            .map(|rank| PeerSpec {
                rank,
                world_size: 2,
                strategy: strategy.to_string(),
                num_params: 3,
            })
            .collect()
    }

    #[test]
    fn call_counts_survive_the_f32_wire() {
        for calls in [0, 1, 1 << 24, (1 << 24) + 1, (1 << 40) + 12_345] {
            assert_eq!(join_count(split_count(calls)), calls);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapped_reductions_stay_in_flight_at_the_optimizer_step() {
        let strategy = Strategy::AsyncOverlap {
            k: NonZeroUsize::new(1).unwrap(),
        };
        let (mut groups, hub) = rendezvous::in_memory(specs(strategy)).await.unwrap();
        let mut slow = groups.pop().unwrap();
        let mut fast = groups.pop().unwrap();

        // The slow rank takes a while to hand in its gradients.
        let slow = tokio::spawn(async move {
            let mut sync = synchronizer(strategy);
            dispersion::measure(&mut slow, 2.0).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;

            let (_, buffers) = sync
                .synchronize(&mut slow, 0, filled(1.0), OverlapBuffers::default())
                .await
                .unwrap();
            buffers.drain().await.unwrap();
            slow.shutdown().await.unwrap();
        });

        let mut sync = synchronizer(strategy);
        let (grads, mut buffers, round) = exchange(
            &mut fast,
            &mut sync,
            0,
            1.0,
            filled(0.0),
            OverlapBuffers::default(),
        )
        .await
        .unwrap();

        assert!(!buffers.settled());
        assert_eq!(grads, filled(0.0));
        assert_eq!(round.unwrap().losses, [1.0, 2.0]);

        buffers.drain().await.unwrap();
        fast.shutdown().await.unwrap();
        slow.await.unwrap();
        hub.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn quiet_steps_measure_nothing() {
        let strategy = Strategy::Periodic {
            k: NonZeroUsize::new(5).unwrap(),
        };
        let (mut groups, hub) = rendezvous::in_memory(specs(strategy)).await.unwrap();

        for group in &mut groups {
            let mut sync = synchronizer(strategy);
            let (grads, buffers, round) = exchange(
                group,
                &mut sync,
                1,
                1.0,
                filled(0.5),
                OverlapBuffers::default(),
            )
            .await
            .unwrap();

            assert_eq!(grads, filled(0.5));
            assert!(round.is_none());
            assert!(!buffers.in_flight());
            assert_eq!(group.calls(), 0);
        }

        future::try_join_all(groups.into_iter().map(ProcessGroup::shutdown))
            .await
            .unwrap();
        hub.await.unwrap().unwrap();
    }
}
