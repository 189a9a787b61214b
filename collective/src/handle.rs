use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::{CollectiveErr, Result};

/// A collective that was issued to the group but whose result may not be there yet.
///
/// Dropping the handle does not cancel the collective, the other ranks still take
/// part in it and the result is discarded.
#[derive(Debug)]
pub struct CollectiveHandle {
    op: &'static str,
    reply: oneshot::Receiver<Result<Vec<f32>>>,
    done: Option<Result<Vec<f32>>>,
}

impl CollectiveHandle {
    pub(crate) fn new(op: &'static str, reply: oneshot::Receiver<Result<Vec<f32>>>) -> Self {
        Self {
            op,
            reply,
            done: None,
        }
    }

    /// The name of the collective behind this handle.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Checks whether the collective completed, without waiting for it.
    ///
    /// # Returns
    /// `true` once a call to `wait` would return immediately.
    pub fn try_wait(&mut self) -> bool {
        if self.done.is_some() {
            return true;
        }

        match self.reply.try_recv() {
            Ok(res) => self.done = Some(res),
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Closed) => self.done = Some(Err(CollectiveErr::Closed)),
        }

        true
    }

    /// Waits for the collective to complete.
    ///
    /// # Returns
    /// The values answered by the group, empty for collectives without a payload.
    pub async fn wait(self) -> Result<Vec<f32>> {
        if let Some(res) = self.done {
            return res;
        }

        self.reply.await.unwrap_or(Err(CollectiveErr::Closed))
    }
}
