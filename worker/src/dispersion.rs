use collective::ProcessGroup;

use crate::{Result, TrainErr};

/// How far apart the ranks' losses were in one synchronization round.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispersion {
    /// Population standard deviation of `losses`.
    pub std_dev: f32,
    pub mean: f32,
    /// Every rank's loss, in rank order.
    pub losses: Vec<f32>,
}

impl Dispersion {
    /// Computes the dispersion of already collected losses.
    pub fn of(losses: Vec<f32>) -> Result<Self> {
        if losses.is_empty() {
            return Err(TrainErr::DivisionByZero);
        }

        let n = losses.len() as f32;
        let mean = losses.iter().sum::<f32>() / n;
        let variance = losses.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / n;

        Ok(Self {
            std_dev: variance.sqrt(),
            mean,
            losses,
        })
    }
}

/// Exchanges `local_loss` with every rank and measures how spread the losses are.
///
/// This is a collective, every rank must call it on the same rounds. A single rank
/// measures its own loss without communicating.
pub async fn measure(group: &mut ProcessGroup, local_loss: f32) -> Result<Dispersion> {
    let losses = if group.world_size() > 1 {
        group.all_gather(vec![local_loss]).await?
    } else {
        vec![local_loss]
    };

    if losses.len() != group.world_size() {
        return Err(TrainErr::ShapeMismatch(format!(
            "gathered {} losses from {} ranks",
            losses.len(),
            group.world_size()
        )));
    }

    Dispersion::of(losses)
}

#[cfg(test)]
mod tests {
    use collective::rendezvous;
    use comms::specs::PeerSpec;
    use futures::future;

    use super::*;

    #[test]
    fn equal_losses_do_not_disperse() {
        let d = Dispersion::of(vec![1.0, 1.0, 1.0]).unwrap();
        assert_eq!(d.std_dev, 0.0);
        assert_eq!(d.mean, 1.0);
    }

    #[test]
    fn uses_the_population_deviation() {
        let d = Dispersion::of(vec![1.0, 3.0]).unwrap();
        assert_eq!(d.std_dev, 1.0);
        assert_eq!(d.mean, 2.0);

        assert!(matches!(Dispersion::of(vec![]), Err(TrainErr::DivisionByZero)));
    }

    #[tokio::test]
    async fn every_rank_sees_every_loss_in_rank_order() {
        let specs = (0..3)
            .map(|rank| PeerSpec {
                rank,
                world_size: 3,
                strategy: "eager".to_string(),
                num_params: 1,
            })
            .collect();
        let (mut groups, hub) = rendezvous::in_memory(specs).await.unwrap();

        let same = future::try_join_all(groups.iter_mut().map(|group| measure(group, 1.0)))
            .await
            .unwrap();
        for d in same {
            assert_eq!(d.std_dev, 0.0);
            assert_eq!(d.losses, [1.0, 1.0, 1.0]);
        }

        let ranked = future::try_join_all(groups.iter_mut().map(|group| {
            let loss = group.rank() as f32;
            measure(group, loss)
        }))
        .await
        .unwrap();
        for d in ranked {
            assert_eq!(d.losses, [0.0, 1.0, 2.0]);
            assert_eq!(d.mean, 1.0);
        }

        future::try_join_all(groups.into_iter().map(ProcessGroup::shutdown))
            .await
            .unwrap();
        hub.await.unwrap().unwrap();
    }
}
