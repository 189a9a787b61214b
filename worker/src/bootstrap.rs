use std::{io, path::PathBuf, sync::Arc};

use collective::{ProcessGroup, rendezvous};
use comms::specs::PeerSpec;
use futures::future;
use log::info;
use machine_learning::{
    Classifier, Sequential,
    dataset::{Dataset, Split},
    optimization::Sgd,
};
use rand::{SeedableRng, rngs::StdRng};

use crate::{
    Result,
    config::{RunConfig, Transport},
    driver::{Datasets, EpochDriver, Learner},
    report::{RecordSink, RunSummary},
    strategy::Strategy,
};

/// Runs every configured strategy back to back, each over a freshly formed group.
///
/// Every strategy's records go to the directory named after the run id handed out
/// by the first group.
///
/// # Returns
/// The summary of every strategy on every rank run by this process.
pub async fn run(cfg: &RunConfig) -> Result<Vec<RunSummary>> {
    let data = Datasets {
        train: Arc::new(Dataset::named(&cfg.dataset, Split::Train)?),
        validation: Arc::new(Dataset::named(&cfg.dataset, Split::Validation)?),
    };

    let mut run_id = None;
    let mut summaries = Vec::new();

    for &strategy in &cfg.strategies {
        info!(strategy = strategy.to_string().as_str(); "starting");

        match cfg.transport {
            Transport::Tcp => {
                let summary = run_tcp(cfg, strategy, &data, &mut run_id).await?;
                summaries.push(summary);
            }
            Transport::Local => {
                let local = run_local(cfg, strategy, &data, &mut run_id).await?;
                summaries.extend(local);
            }
        }
    }

    Ok(summaries)
}

async fn run_tcp(
    cfg: &RunConfig,
    strategy: Strategy,
    data: &Datasets,
    run_id: &mut Option<String>,
) -> Result<RunSummary> {
    let world_size = cfg.world_size.get();
    let hub = match cfg.rank {
        0 => Some(rendezvous::host(&cfg.addr, world_size).await?),
        _ => None,
    };

    let learner = build_learner(cfg, data);
    let spec = peer_spec(cfg.rank, cfg, strategy, &learner);
    let group = rendezvous::connect(&cfg.addr, spec, cfg.connect_timeout).await?;
    let log_dir = log_dir(cfg, &group, run_id);

    let summary = run_rank(cfg, strategy, group, learner, data.clone(), log_dir).await?;

    if let Some(hub) = hub {
        hub.await
            .map_err(|e| io::Error::other(format!("hub join error: {e}")))??;
    }

    Ok(summary)
}

async fn run_local(
    cfg: &RunConfig,
    strategy: Strategy,
    data: &Datasets,
    run_id: &mut Option<String>,
) -> Result<Vec<RunSummary>> {
    let world_size = cfg.world_size.get();
    let learners: Vec<_> = (0..world_size).map(|_| build_learner(cfg, data)).collect();
    let specs = learners
        .iter()
        .enumerate()
        .map(|(rank, learner)| peer_spec(rank, cfg, strategy, learner))
        .collect();

    let (groups, hub) = rendezvous::in_memory(specs).await?;

    let ranks = groups.into_iter().zip(learners).map(|(group, learner)| {
        let cfg = cfg.clone();
        let data = data.clone();
        let log_dir = log_dir(&cfg, &group, run_id);

        tokio::spawn(async move { run_rank(&cfg, strategy, group, learner, data, log_dir).await })
    });

    let summaries = future::try_join_all(ranks)
        .await
        .map_err(|e| io::Error::other(format!("rank join error: {e}")))?
        .into_iter()
        .collect::<Result<Vec<_>>>()?;

    hub.await
        .map_err(|e| io::Error::other(format!("hub join error: {e}")))??;

    Ok(summaries)
}

async fn run_rank(
    cfg: &RunConfig,
    strategy: Strategy,
    group: ProcessGroup,
    learner: Learner<Sequential, Sgd>,
    data: Datasets,
    log_dir: Option<PathBuf>,
) -> Result<RunSummary> {
    let rank = group.rank();
    let sink = match log_dir {
        Some(dir) => RecordSink::create(&dir, strategy.name(), rank).await?,
        None => RecordSink::disabled(strategy.name(), rank),
    };

    let driver = EpochDriver::new(
        group,
        strategy,
        learner,
        data,
        cfg.batch_size,
        cfg.seed,
        sink,
    )?;

    driver.run(cfg.epochs).await
}

/// Every rank builds the same model out of the same seed.
fn build_learner(cfg: &RunConfig, data: &Datasets) -> Learner<Sequential, Sgd> {
    let mut sizes = Vec::with_capacity(cfg.hidden.len() + 2);
    sizes.push(data.train.num_features());
    sizes.extend(&cfg.hidden);
    sizes.push(data.train.classes());

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let model = Sequential::mlp(&sizes, &mut rng);
    let optimizer = Sgd::new(cfg.learning_rate, cfg.momentum, cfg.weight_decay);

    Learner::new(model, optimizer)
}

fn peer_spec(
    rank: usize,
    cfg: &RunConfig,
    strategy: Strategy,
    learner: &Learner<Sequential, Sgd>,
) -> PeerSpec {
    PeerSpec {
        rank,
        world_size: cfg.world_size.get(),
        strategy: strategy.to_string(),
        num_params: learner.model.layout().num_params(),
    }
}

/// `<log_dir>/<run_id>`, the run id being the one of the run's first group.
fn log_dir(cfg: &RunConfig, group: &ProcessGroup, run_id: &mut Option<String>) -> Option<PathBuf> {
    let run_id = run_id.get_or_insert_with(|| group.run_id().to_string());
    cfg.log_dir.as_ref().map(|dir| dir.join(run_id.as_str()))
}
