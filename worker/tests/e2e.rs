use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use collective::rendezvous;
use comms::specs::PeerSpec;
use machine_learning::{
    Classifier, Sequential,
    dataset::{Dataset, Split},
    optimization::Sgd,
};
use rand::{SeedableRng, rngs::StdRng};
use worker::{
    Datasets, EpochDriver, Learner, RunConfig, Strategy, TrainErr, Transport, bootstrap,
    report::RecordSink,
};

fn nz(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

fn local_config(world_size: usize, epochs: usize) -> RunConfig {
    RunConfig {
        rank: 0,
        world_size: nz(world_size),
        batch_size: nz(64),
        epochs,
        learning_rate: 0.01,
        momentum: 0.9,
        weight_decay: 0.0,
        dataset: "blobs-small".to_string(),
        hidden: vec![32],
        strategies: Strategy::all(nz(world_size), 5).unwrap(),
        addr: String::new(),
        log_dir: None,
        seed: 7548,
        connect_timeout: Duration::from_secs(5),
        transport: Transport::Local,
    }
}

fn datasets() -> Datasets {
    Datasets {
        train: Arc::new(Dataset::named("blobs-small", Split::Train).unwrap()),
        validation: Arc::new(Dataset::named("blobs-small", Split::Validation).unwrap()),
    }
}

fn learner(data: &Datasets) -> Learner<Sequential, Sgd> {
    let mut rng = StdRng::seed_from_u64(7548);
    let sizes = [data.train.num_features(), 32, data.train.classes()];

    Learner::new(Sequential::mlp(&sizes, &mut rng), Sgd::new(0.01, 0.9, 0.0))
}

fn spec(rank: usize, world_size: usize, strategy: Strategy, num_params: usize) -> PeerSpec {
    PeerSpec {
        rank,
        world_size,
        strategy: strategy.to_string(),
        num_params,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_strategy_runs_back_to_back() {
    // 2048 samples over 2 ranks of 64 per step: 16 steps per epoch.
    let summaries = bootstrap::run(&local_config(2, 2)).await.unwrap();
    assert_eq!(summaries.len(), 6);

    let counts: Vec<_> = summaries
        .iter()
        .map(|s| (s.strategy.as_str(), s.reduce_count))
        .collect();
    assert_eq!(
        counts,
        [
            ("eager", 32),
            ("eager", 32),
            ("periodic(k=5)", 6),
            ("periodic(k=5)", 6),
            ("async-overlap(k=5)", 8),
            ("async-overlap(k=5)", 8),
        ]
    );
}

#[tokio::test]
async fn a_single_rank_never_communicates() {
    let summaries = bootstrap::run(&local_config(1, 1)).await.unwrap();

    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].strategy, "eager");
    assert_eq!(summaries[0].reduce_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn eager_ranks_learn_the_blobs_together() {
    let data = datasets();
    let num_params = learner(&data).model.layout().num_params();
    let specs = (0..2)
        .map(|rank| spec(rank, 2, Strategy::Eager, num_params))
        .collect();
    let (groups, hub) = rendezvous::in_memory(specs).await.unwrap();

    let ranks: Vec<_> = groups.into_iter().map(|group| {
        let data = data.clone();
        tokio::spawn(async move {
            let sink = RecordSink::disabled("eager", group.rank());
            let mut driver = EpochDriver::new(
                group,
                Strategy::Eager,
                learner(&data),
                data,
                nz(32),
                7548,
                sink,
            )
            .unwrap();

            let before = driver.validate_epoch(0).await.unwrap();
            for epoch in 0..5 {
                assert_eq!(driver.train_epoch(epoch).await.unwrap(), 32);
            }
            let after = driver.validate_epoch(5).await.unwrap();

            driver.run(0).await.unwrap();
            (before, after)
        })
    })
    .collect();

    let mut results = Vec::new();
    for rank in ranks {
        results.push(rank.await.unwrap());
    }
    hub.await.unwrap().unwrap();

    for (before, after) in &results {
        assert!(after.loss < before.loss, "{} >= {}", after.loss, before.loss);
        assert!(after.top1 > 50.0, "top-1 only reached {}%", after.top1);
    }

    // Averaged gradients keep the replicas identical.
    assert_eq!(results[0].1.loss.to_bits(), results[1].1.loss.to_bits());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn a_lost_rank_aborts_the_epoch() {
    let data = datasets();
    let num_params = learner(&data).model.layout().num_params();
    let specs = (0..2)
        .map(|rank| spec(rank, 2, Strategy::Eager, num_params))
        .collect();
    let (mut groups, _hub) = rendezvous::in_memory(specs).await.unwrap();
    drop(groups.pop());

    let group = groups.pop().unwrap();
    let mut driver = EpochDriver::new(
        group,
        Strategy::Eager,
        learner(&data),
        data,
        nz(32),
        7548,
        RecordSink::disabled("eager", 0),
    )
    .unwrap();

    let err = driver.train_epoch(0).await.unwrap_err();
    assert!(matches!(err, TrainErr::Communication(_)), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn records_land_in_the_run_directory() {
    let dir = std::env::temp_dir().join(format!("worker-e2e-{}", std::process::id()));
    let mut cfg = local_config(2, 1);
    cfg.strategies = vec![Strategy::Periodic { k: nz(4) }];
    cfg.log_dir = Some(dir.clone());

    bootstrap::run(&cfg).await.unwrap();

    let runs: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
    assert_eq!(runs.len(), 1);
    let run_dir = runs[0].as_ref().unwrap().path();

    for rank in 0..2 {
        let text = std::fs::read_to_string(run_dir.join(format!("periodic_{rank}.log"))).unwrap();
        // 16 steps, a train and a validation epoch and the summary.
        assert_eq!(text.lines().count(), 16 + 2 + 1);

        let last: serde_json::Value = serde_json::from_str(text.lines().last().unwrap()).unwrap();
        assert_eq!(last["record"], "summary");
        assert_eq!(last["reduce_count"], 3);
    }

    std::fs::remove_dir_all(&dir).unwrap();
}
