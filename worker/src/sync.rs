use std::num::NonZeroUsize;

use collective::{CollectiveHandle, ProcessGroup};
use log::debug;
use machine_learning::{GradientSet, ParamLayout};

use crate::{Result, TrainErr, strategy::Strategy};

/// The two slots of the async-overlap strategy.
///
/// `send` is the reduction issued on the last rotation and still in flight, `recv` is the
/// one issued the rotation before, ready to be blended in. Both start empty every epoch.
#[derive(Debug, Default)]
pub struct OverlapBuffers {
    send: Option<CollectiveHandle>,
    recv: Option<CollectiveHandle>,
}

impl OverlapBuffers {
    /// Returns true if a reduction is still pending.
    pub fn in_flight(&self) -> bool {
        self.send.is_some() || self.recv.is_some()
    }

    /// Returns true if no reduction is left pending, without waiting for any.
    pub fn settled(&mut self) -> bool {
        [&mut self.recv, &mut self.send]
            .into_iter()
            .flatten()
            .all(|handle| handle.try_wait())
    }

    /// Waits for every pending reduction and discards its result.
    ///
    /// Must be called before issuing collectives that aren't part of the rotation, so
    /// that every reduction issued in the epoch completed on every rank.
    pub async fn drain(self) -> Result<()> {
        for handle in [self.recv, self.send].into_iter().flatten() {
            handle.wait().await?;
        }

        Ok(())
    }
}

/// What a synchronizer did so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncCounters {
    /// Reductions issued, blocking or not.
    pub communications: u64,
    pub rotations: u64,
    /// Received sums blended into a local gradient.
    pub blends: u64,
}

/// Combines this rank's gradients with the other ranks' ones following a `Strategy`.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    strategy: Strategy,
    world_size: NonZeroUsize,
    layout: ParamLayout,
    counters: SyncCounters,
}

impl Synchronizer {
    /// Creates a new `Synchronizer`.
    ///
    /// # Arguments
    /// * `strategy` - When and how to combine gradients.
    /// * `world_size` - The amount of ranks in the group.
    /// * `layout` - The layout every gradient set must follow, the same on every rank.
    pub fn new(strategy: Strategy, world_size: NonZeroUsize, layout: ParamLayout) -> Self {
        Self {
            strategy,
            world_size,
            layout,
            counters: SyncCounters::default(),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn counters(&self) -> SyncCounters {
        self.counters
    }

    /// Returns true if `synchronize` issues a collective at `step`.
    pub fn communicates_at(&self, step: usize) -> bool {
        self.world_size.get() > 1 && self.strategy.communicates_at(step)
    }

    /// Combines the gradients of `step` across the group.
    ///
    /// Every rank must call this with the same `step` sequence, the collectives issued here
    /// only complete once every rank issued them.
    ///
    /// # Arguments
    /// * `group` - The process group.
    /// * `step` - The step within the epoch, starting at 0.
    /// * `grads` - This rank's gradients for the step.
    /// * `buffers` - The async-overlap slots, as returned by the previous call.
    ///
    /// # Returns
    /// The gradients to apply, following the same layout as `grads`, and the slots to
    /// pass on to the next call.
    pub async fn synchronize(
        &mut self,
        group: &mut ProcessGroup,
        step: usize,
        grads: GradientSet,
        mut buffers: OverlapBuffers,
    ) -> Result<(GradientSet, OverlapBuffers)> {
        grads
            .check_layout(&self.layout)
            .map_err(|err| TrainErr::ShapeMismatch(err.to_string()))?;

        if !self.communicates_at(step) {
            return Ok((grads, buffers));
        }

        self.counters.communications += 1;
        let grads = match self.strategy {
            Strategy::Eager | Strategy::Periodic { .. } => self.average(group, &grads).await?,
            Strategy::AsyncOverlap { .. } => self.overlap(group, grads, &mut buffers).await?,
        };

        Ok((grads, buffers))
    }

    async fn average(&self, group: &mut ProcessGroup, grads: &GradientSet) -> Result<GradientSet> {
        let world_size = self.world_size.get() as f32;

        let mut sum = group.all_reduce_sum(grads.flatten()).await?;
        sum.iter_mut().for_each(|x| *x /= world_size);

        self.rebuild(&sum)
    }

    async fn overlap(
        &mut self,
        group: &mut ProcessGroup,
        grads: GradientSet,
        buffers: &mut OverlapBuffers,
    ) -> Result<GradientSet> {
        buffers.recv = buffers.send.take();
        self.counters.rotations += 1;

        // The reduction carries this step's own gradients, not the blended ones.
        let local = grads.flatten();
        buffers.send = Some(group.all_reduce_sum_async(local.clone())?);

        let Some(recv) = buffers.recv.take() else {
            return Ok(grads);
        };

        let received = recv.wait().await?;
        if received.len() != local.len() {
            return Err(TrainErr::ShapeMismatch(format!(
                "received {} values for {} local ones",
                received.len(),
                local.len()
            )));
        }

        // The received sum weighs `world_size` times the fresh local gradient.
        let world_size = self.world_size.get() as f32;
        let blended: Vec<_> = local
            .iter()
            .zip(&received)
            .map(|(l, r)| (l + r * world_size) / (world_size + 1.0))
            .collect();

        self.counters.blends += 1;
        debug!(blends = self.counters.blends; "blended a received reduction");

        self.rebuild(&blended)
    }

    fn rebuild(&self, values: &[f32]) -> Result<GradientSet> {
        GradientSet::unflatten(&self.layout, values)
            .map_err(|err| TrainErr::ShapeMismatch(err.to_string()))
    }
}
