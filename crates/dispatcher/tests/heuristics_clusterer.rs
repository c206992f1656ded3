mod common;

use common::Setup;
use scheduler_core::JobStatus;
use scheduler_dispatcher::tasks::HeuristicsClusterer;
use scheduler_dispatcher::{Task, TaskRunner};
use scheduler_domain::{commands, events, Command, Experiment, ExperimentStatus, ExperimentType, HeuristicSignature};
use scheduler_testing_utils::{
    data_report, heuristic, replies, ChannelRecorder, ConfigurationBuilder, Reply, ServerBuilder, ServerScript,
    VersionBuilder,
};

const ALGORITHM: &str = "kmeans";
const CLUSTERING_PORT: u16 = 15000;

/// 一个已完成的签名记录实验，数据报告中带有预测器数据
async fn recorded_signature(setup: &Setup, author: &str, name: &str, content: &[u8]) -> HeuristicSignature {
    let store = &setup.harness.store;
    let repos = &setup.ctx.repositories;

    let heuristic = store.insert_heuristic(heuristic(author, name)).await.unwrap();
    let version = store
        .insert_version(VersionBuilder::new(heuristic.id).checked().build())
        .await
        .unwrap();
    let configuration = repos
        .experiments
        .create_configuration(
            &ConfigurationBuilder::new(&format!("{author}/{name}/signature"), ExperimentType::Signature, 1).build(),
        )
        .await
        .unwrap();

    let filename = setup
        .harness
        .storage
        .data_reports
        .save(&data_report(&[("predictor.data", content)]))
        .await
        .unwrap();
    let mut experiment = Experiment::new(configuration.name.clone(), configuration.id);
    experiment.status = ExperimentStatus::Done;
    experiment.data_report = Some(filename);
    let experiment = repos.experiments.create_experiment(&experiment).await.unwrap();

    repos
        .evaluations
        .create_signature(&HeuristicSignature {
            id: 0,
            heuristic_version_id: version.id,
            experiment_id: experiment.id,
        })
        .await
        .unwrap()
}

async fn clustering_server(setup: &Setup, script: ServerScript) -> ChannelRecorder {
    setup.harness.store.add_clustering_algorithm(ALGORITHM).await.unwrap();
    setup
        .harness
        .store
        .insert_server(ServerBuilder::clustering(CLUSTERING_PORT, ALGORITHM).build())
        .await
        .unwrap();
    setup
        .harness
        .connector
        .add_server("127.0.0.1", CLUSTERING_PORT, script)
}

async fn cluster(setup: &Setup, status: JobStatus) {
    let runner = TaskRunner::new(HeuristicsClusterer::new(), setup.ctx.clone());
    let command = Command::ClusterHeuristics {
        algorithm: ALGORITHM.to_string(),
    };
    let job_id = runner.enqueue(command.to_message()).await.unwrap().unwrap();
    assert!(setup.wait_status(job_id, status).await);
}

async fn processed(setup: &Setup) -> Vec<bool> {
    setup
        .ctx
        .repositories
        .clustering
        .find_statuses(ALGORITHM)
        .await
        .unwrap()
        .into_iter()
        .map(|status| status.processed)
        .collect()
}

#[tokio::test]
async fn test_signatures_are_clustered_and_published() {
    let mut setup = Setup::new();
    recorded_signature(&setup, "Alice", "edges", b"alice-signature").await;
    recorded_signature(&setup, "Bob", "corners", b"bob-signature").await;
    let recorder = clustering_server(
        &setup,
        ServerScript::new().on("CLUSTER", vec![Reply::msg("RESULTS 7"), Reply::data(*b"<tree/>")]),
    )
    .await;

    cluster(&setup, JobStatus::Done).await;

    assert_eq!(recorder.count_sent("ADD_SIGNATURE"), 2);
    assert_eq!(recorder.count_sent("CLUSTER"), 1);
    let mut sent = recorder.data_sent();
    sent.sort();
    assert_eq!(sent, vec![b"alice-signature".to_vec(), b"bob-signature".to_vec()]);

    assert_eq!(processed(&setup).await, vec![true, true]);
    let published = tokio::fs::read(setup.harness.storage.snippets.clustering_path(ALGORITHM))
        .await
        .unwrap();
    assert_eq!(published, b"<tree/>");

    let event = setup.next_message(events::HEURISTICS_CLUSTERING_DONE.name).await.unwrap();
    assert_eq!(event.str_param(0).unwrap(), ALGORITHM);
}

#[tokio::test]
async fn test_failed_clustering_keeps_signatures_unprocessed() {
    let setup = Setup::new();
    recorded_signature(&setup, "Alice", "edges", b"alice-signature").await;
    recorded_signature(&setup, "Bob", "corners", b"bob-signature").await;
    let recorder = clustering_server(&setup, ServerScript::new().on("CLUSTER", replies(&["ERROR 'out of memory'"]))).await;

    cluster(&setup, JobStatus::Failed).await;

    // 所有签名都已发送，但结果没有取回，全部保持未处理
    assert_eq!(recorder.count_sent("ADD_SIGNATURE"), 2);
    assert_eq!(processed(&setup).await, vec![false, false]);
    assert!(!setup.harness.storage.snippets.clustering_path(ALGORITHM).exists());
}

#[tokio::test]
async fn test_nothing_to_cluster() {
    let setup = Setup::new();
    let recorder = clustering_server(&setup, ServerScript::new()).await;

    cluster(&setup, JobStatus::Done).await;
    assert_eq!(recorder.connections(), 0);
}

#[tokio::test]
async fn test_startup_schedules_algorithms_with_new_signatures() {
    let setup = Setup::new();
    setup.harness.store.add_clustering_algorithm(ALGORITHM).await.unwrap();
    setup.harness.store.add_clustering_algorithm("hierarchical").await.unwrap();

    let clusterer = HeuristicsClusterer::new();
    assert!(clusterer.on_startup(&setup.ctx).await.unwrap().is_empty());

    recorded_signature(&setup, "Alice", "edges", b"alice-signature").await;
    let scheduled = clusterer.on_startup(&setup.ctx).await.unwrap();
    assert_eq!(scheduled.len(), 2);
    assert!(scheduled.iter().all(|c| c.is(commands::CLUSTER_HEURISTICS.name)));
}
