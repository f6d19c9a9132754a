use std::{fs, path::PathBuf, sync::Arc};

use federation::{
    DataInterface, DatasetKind, ExperimentParams, Federation, FederationErr, FlExperiment,
    ShardDescriptor,
};
use fl_cifar10::{
    Cifar10Data, Cifar10ShardDescriptor, TrainingConfig,
    cifar10::{RECORD_SIZE, TEST_FILE, TRAIN_FILES},
    net, tasks,
};
use machine_learning::dataset::Dataset;

const TRAIN_RECORDS_PER_FILE: usize = 4;
const TEST_RECORDS: usize = 6;

/// Writes batch files whose record `i` has label `i % 10` and every pixel set to `i`.
fn write_batches(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fl_cifar10_{}_{name}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    let batch = |first: usize, len: usize| -> Vec<u8> {
        (first..first + len)
            .flat_map(|i| {
                let mut record = vec![i as u8; RECORD_SIZE];
                record[0] = (i % 10) as u8;
                record
            })
            .collect()
    };

    for (f, file) in TRAIN_FILES.iter().enumerate() {
        let bytes = batch(f * TRAIN_RECORDS_PER_FILE, TRAIN_RECORDS_PER_FILE);
        fs::write(dir.join(file), bytes).unwrap();
    }
    fs::write(dir.join(TEST_FILE), batch(0, TEST_RECORDS)).unwrap();

    dir
}

fn label(dataset: &Dataset, i: usize) -> usize {
    let (_, y) = dataset.gather(&[i]).unwrap();
    y.row(0).iter().position(|&v| v == 1.).unwrap()
}

fn first_pixel(dataset: &Dataset, i: usize) -> f32 {
    let (x, _) = dataset.gather(&[i]).unwrap();
    x.iter().copied().next().unwrap()
}

#[test]
fn shards_are_contiguous_across_files() {
    let dir = write_batches("contiguous");

    let first = Cifar10ShardDescriptor::new(&dir, 1, 2).unwrap();
    let second = Cifar10ShardDescriptor::new(&dir, 2, 2).unwrap();

    let train = first.get_dataset(DatasetKind::Train).unwrap();
    assert_eq!(train.len(), 10);
    assert_eq!(train.sample_shape(), [3, 32, 32]);
    assert_eq!(label(&train, 0), 0);
    assert_eq!(label(&train, 9), 9);

    let train = second.get_dataset(DatasetKind::Train).unwrap();
    assert_eq!(train.len(), 10);
    assert_eq!(label(&train, 0), 0);
    assert_eq!(first_pixel(&train, 0), fl_cifar10::cifar10::normalize(10));
    assert_eq!(first_pixel(&train, 9), fl_cifar10::cifar10::normalize(19));

    let valid = second.get_dataset(DatasetKind::Valid).unwrap();
    assert_eq!(valid.len(), 3);
    assert_eq!(label(&valid, 0), 3);

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn limit_caps_every_split() {
    let dir = write_batches("limit");
    let shard = Cifar10ShardDescriptor::new(&dir, 1, 1)
        .unwrap()
        .with_limit(Some(5));

    assert_eq!(shard.get_dataset(DatasetKind::Train).unwrap().len(), 5);
    assert_eq!(shard.get_dataset(DatasetKind::Valid).unwrap().len(), 5);

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn missing_batches_are_io_errors() {
    let dir = write_batches("missing");
    fs::remove_file(dir.join(TRAIN_FILES[2])).unwrap();

    let mut data = Cifar10Data::new(4, 4).unwrap();
    let shard = Cifar10ShardDescriptor::new(&dir, 1, 2).unwrap();

    assert!(matches!(
        data.set_shard_descriptor(Arc::new(shard)),
        Err(FederationErr::Io(_))
    ));

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn truncated_batches_are_rejected() {
    let dir = write_batches("truncated");
    fs::write(dir.join(TEST_FILE), vec![0; RECORD_SIZE + 7]).unwrap();

    let shard = Cifar10ShardDescriptor::new(&dir, 1, 1).unwrap();
    assert!(shard.get_dataset(DatasetKind::Train).is_ok());
    assert!(shard.get_dataset(DatasetKind::Valid).is_err());

    fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tutorial_runs_on_a_local_federation() {
    let dir = write_batches("tutorial");

    let config = TrainingConfig {
        data_dir: dir.clone(),
        rounds: 2,
        train_batch_size: 4,
        valid_batch_size: 4,
        seed: Some(9),
        ..Default::default()
    };

    let shards = (1..=config.shards)
        .map(|rank| {
            let shard = Cifar10ShardDescriptor::new(&config.data_dir, rank, config.shards).unwrap();
            Arc::new(shard) as Arc<dyn ShardDescriptor>
        })
        .collect();
    let mut federation = Federation::local(shards);

    let registry = federation.shard_registry().await.unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(registry[0].shard_info.sample_shape, [3, 32, 32]);
    assert_eq!(registry[0].shard_info.target_shape, [10]);

    let model = net::cnn_model(&config).unwrap();
    let size = model.size();

    let mut experiment = FlExperiment::new(federation, "cifar10_cnn");
    let params = ExperimentParams {
        rounds: config.rounds,
        seed: config.seed,
        ..Default::default()
    };
    experiment
        .start(
            model,
            tasks::task_keeper(config.epochs).unwrap(),
            Cifar10Data::new(config.train_batch_size, config.valid_batch_size).unwrap(),
            params,
        )
        .await
        .unwrap();

    let report = experiment.wait().await.unwrap();
    assert_eq!(report.rounds.len(), 2);
    assert_eq!(report.metrics.len(), 2 * 3 * 2);

    let acc = report.final_accuracy().unwrap();
    assert!((0. ..=1.).contains(&acc));
    for record in &report.metrics {
        assert!(record.metrics.values().all(|v| v.is_finite()));
    }

    assert_eq!(experiment.best_model().await.unwrap().len(), size);

    fs::remove_dir_all(dir).unwrap();
}
