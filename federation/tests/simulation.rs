use std::{num::NonZeroUsize, sync::Arc};

use comms::specs::{
    experiment::{AggregationSpec, Metrics, OptTreatment, RoundPhase, TaskKind},
    model::{ActFnSpec, LayerSpec, LossFnSpec, ModelSpec, OptimizerSpec},
};
use federation::{
    DataInterface, DatasetKind, ExperimentParams, Federation, FederationErr, FlExperiment,
    ModelInterface, ShardDescriptor, TaskContext, TaskKeeper,
};
use futures::StreamExt;
use machine_learning::dataset::{DataLoader, Dataset};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// 1x4x4 images labelled by whether their top or bottom half is brighter.
struct Brightness {
    seed: u64,
    len: usize,
}

impl ShardDescriptor for Brightness {
    fn get_dataset(&self, kind: DatasetKind) -> federation::Result<Dataset> {
        let offset = match kind {
            DatasetKind::Train => 0,
            DatasetKind::Valid => 1000,
        };
        let mut rng = StdRng::seed_from_u64(self.seed + offset);
        let mut samples: Vec<f32> = Vec::with_capacity(self.len * 16);
        let mut labels = Vec::with_capacity(self.len);

        for _ in 0..self.len {
            let label: u8 = rng.random_range(0..2);

            for row in 0..4 {
                let base: f32 = if (row < 2) == (label == 0) { 0.5 } else { 0. };
                samples.extend((0..4).map(|_| base + rng.random_range(0.0..0.5)));
            }

            labels.push(label);
        }

        Ok(Dataset::classification(samples, &labels, vec![1, 4, 4], 2)?)
    }

    fn sample_shape(&self) -> Vec<usize> {
        vec![1, 4, 4]
    }

    fn target_shape(&self) -> Vec<usize> {
        vec![2]
    }

    fn description(&self) -> String {
        format!("brightness shard {}", self.seed)
    }
}

#[derive(Clone)]
struct InMemoryData {
    batch_size: NonZeroUsize,
    train: Option<Arc<Dataset>>,
    valid: Option<Arc<Dataset>>,
}

impl InMemoryData {
    fn new(batch_size: usize) -> Self {
        Self {
            batch_size: NonZeroUsize::new(batch_size).unwrap(),
            train: None,
            valid: None,
        }
    }
}

impl DataInterface for InMemoryData {
    fn set_shard_descriptor(&mut self, shard: Arc<dyn ShardDescriptor>) -> federation::Result<()> {
        self.train = Some(Arc::new(shard.get_dataset(DatasetKind::Train)?));
        self.valid = Some(Arc::new(shard.get_dataset(DatasetKind::Valid)?));
        Ok(())
    }

    fn train_loader(&self, seed: u64) -> federation::Result<DataLoader> {
        let train = self
            .train
            .clone()
            .ok_or(FederationErr::MissingShardDescriptor)?;
        Ok(DataLoader::new(train, self.batch_size).shuffled(seed))
    }

    fn valid_loader(&self) -> federation::Result<DataLoader> {
        let valid = self
            .valid
            .clone()
            .ok_or(FederationErr::MissingShardDescriptor)?;
        Ok(DataLoader::new(valid, self.batch_size))
    }

    fn train_data_size(&self) -> usize {
        self.train.as_ref().map_or(0, |d| d.len())
    }

    fn valid_data_size(&self) -> usize {
        self.valid.as_ref().map_or(0, |d| d.len())
    }
}

fn train(ctx: TaskContext<'_>) -> federation::Result<Metrics> {
    let mut loader = ctx.data.train_loader(ctx.seed)?;
    let stats = ctx.state.train_epoch(&mut loader)?;
    Ok([("train_loss".to_string(), stats.loss)].into())
}

fn broken(_: TaskContext<'_>) -> federation::Result<Metrics> {
    Err(FederationErr::Config("broken task".into()))
}

fn validate(ctx: TaskContext<'_>) -> federation::Result<Metrics> {
    let mut loader = ctx.data.valid_loader()?;
    let stats = ctx.state.evaluate(&mut loader)?;
    Ok([
        ("acc".to_string(), stats.accuracy),
        ("loss".to_string(), stats.loss),
    ]
    .into())
}

fn model() -> ModelInterface {
    let spec = ModelSpec::Sequential {
        input_shape: vec![1, 4, 4],
        layers: vec![
            LayerSpec::Conv2d {
                in_channels: 1,
                out_channels: 2,
                kernel: 3,
                stride: 1,
                padding: 0,
                act_fn: Some(ActFnSpec::Relu),
            },
            LayerSpec::Flatten,
            LayerSpec::Dense {
                dim: (8, 2),
                act_fn: None,
            },
        ],
        init: Default::default(),
    };

    let optimizer = OptimizerSpec::GradientDescentWithMomentum {
        learning_rate: 0.05,
        momentum: 0.9,
    };

    ModelInterface::new(spec, optimizer, LossFnSpec::CrossEntropy, Some(11)).unwrap()
}

fn tasks() -> TaskKeeper {
    let mut tasks = TaskKeeper::new();
    tasks.register("train", TaskKind::Train, train).unwrap();
    tasks
        .register("validate", TaskKind::Validate, validate)
        .unwrap();
    tasks
}

fn federation(shards: usize) -> Federation {
    let shards = (0..shards)
        .map(|i| {
            Arc::new(Brightness {
                seed: i as u64,
                len: 96,
            }) as Arc<dyn ShardDescriptor>
        })
        .collect();

    Federation::local(shards)
}

fn params(rounds: usize) -> ExperimentParams {
    ExperimentParams {
        rounds,
        seed: Some(3),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_experiment_trains_and_reports() {
    let model = model();
    let size = model.size();

    let mut experiment = FlExperiment::new(federation(2), "brightness");
    experiment
        .start(model, tasks(), InMemoryData::new(8), params(3))
        .await
        .unwrap();

    let report = experiment.wait().await.unwrap();

    assert_eq!(report.rounds.len(), 3);
    assert_eq!(report.metrics.len(), 2 * 3 * 3);
    assert!(report.best_round.is_some());
    assert!(report.final_accuracy().is_some());

    let first = report.rounds[0]
        .metric(RoundPhase::AggregatedModelValidation, "loss")
        .unwrap();
    let last = report.rounds[2]
        .metric(RoundPhase::LocallyTunedModelValidation, "loss")
        .unwrap();
    assert!(last < first, "loss went from {first} to {last}");

    for summary in &report.rounds {
        let train = summary
            .tasks
            .iter()
            .find(|t| t.phase == RoundPhase::Train)
            .unwrap();
        assert_eq!(train.data_size, 2 * 96);
        assert!(train.metrics.contains_key("train_loss"));
    }

    let streamed: Vec<_> = experiment.stream_metrics().collect().await;
    assert_eq!(streamed.len(), report.metrics.len());
    assert!(streamed.iter().all(Result::is_ok));

    assert_eq!(experiment.best_model().await.unwrap().len(), size);
    assert_eq!(experiment.last_model().await.unwrap().len(), size);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn median_aggregation_with_local_optimizer_state() {
    let mut tasks = tasks();
    tasks
        .set_aggregation("train", AggregationSpec::Median)
        .unwrap();

    let params = ExperimentParams {
        opt_treatment: OptTreatment::ContinueLocal,
        ..params(2)
    };

    let mut experiment = FlExperiment::new(federation(3), "median");
    experiment
        .start(model(), tasks, InMemoryData::new(16), params)
        .await
        .unwrap();

    let report = experiment.wait().await.unwrap();
    assert_eq!(report.metrics.len(), 3 * 3 * 2);

    let names = report.metrics.iter().map(|r| r.collaborator.as_str());
    let collaborators: std::collections::BTreeSet<_> = names.collect();
    assert_eq!(collaborators.len(), 3);
}

/// Trains like `train`, also reporting how far a zero gradient step moves the parameters,
/// which is only non zero while the optimizer remembers a velocity.
fn train_with_carried_velocity(ctx: TaskContext<'_>) -> federation::Result<Metrics> {
    let before = ctx.state.params().to_vec();
    ctx.state.apply_gradient(&vec![0.; before.len()])?;

    let carried: f32 = before
        .iter()
        .zip(ctx.state.params())
        .map(|(a, b)| (a - b).abs())
        .sum();
    ctx.state.set_params(&before)?;

    let mut metrics = train(ctx)?;
    metrics.insert("carried".to_string(), carried);
    Ok(metrics)
}

async fn carried_velocity(opt_treatment: OptTreatment) -> Vec<(usize, f32)> {
    let mut tasks = TaskKeeper::new();
    tasks
        .register("train", TaskKind::Train, train_with_carried_velocity)
        .unwrap();
    tasks
        .register("validate", TaskKind::Validate, validate)
        .unwrap();

    let params = ExperimentParams {
        opt_treatment,
        ..params(2)
    };

    let mut experiment = FlExperiment::new(federation(1), "velocity");
    experiment
        .start(model(), tasks, InMemoryData::new(16), params)
        .await
        .unwrap();

    let report = experiment.wait().await.unwrap();
    report
        .metrics
        .iter()
        .filter(|r| r.phase == RoundPhase::Train)
        .map(|r| (r.round, r.metrics["carried"]))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_clears_the_optimizer_between_rounds() {
    let carried = carried_velocity(OptTreatment::Reset).await;
    assert_eq!(carried, [(0, 0.), (1, 0.)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn continue_local_keeps_the_optimizer_between_rounds() {
    let carried = carried_velocity(OptTreatment::ContinueLocal).await;

    assert_eq!(carried.len(), 2);
    assert_eq!(carried[0], (0, 0.));
    assert_eq!(carried[1].0, 1);
    assert!(carried[1].1 > 0., "no velocity carried over: {carried:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_task_aborts_the_experiment() {
    let mut tasks = tasks();
    tasks
        .register("broken", TaskKind::Validate, broken)
        .unwrap();

    let initial = model();
    let mut experiment = FlExperiment::new(federation(2), "broken");
    let res = experiment
        .start(initial, tasks, InMemoryData::new(8), params(2))
        .await;

    assert!(res.is_err());
    assert!(matches!(experiment.wait().await, Err(FederationErr::NotStarted)));
}

#[tokio::test]
async fn zero_rounds_keep_the_initial_model() {
    let initial = model();
    let params_before = initial.params().to_vec();

    let mut experiment = FlExperiment::new(federation(1), "idle");
    experiment
        .start(initial, tasks(), InMemoryData::new(8), params(0))
        .await
        .unwrap();

    let report = experiment.wait().await.unwrap();
    assert!(report.metrics.is_empty());
    assert_eq!(report.best_round, None);
    assert_eq!(experiment.last_model().await.unwrap(), params_before);
}

#[tokio::test]
async fn experiments_need_collaborators_and_tasks() {
    let mut experiment = FlExperiment::new(Federation::local(Vec::new()), "empty");
    let res = experiment
        .start(model(), tasks(), InMemoryData::new(8), params(1))
        .await;
    assert!(matches!(res, Err(FederationErr::Config(_))));

    let mut experiment = FlExperiment::new(federation(1), "no tasks");
    let res = experiment
        .start(model(), TaskKeeper::new(), InMemoryData::new(8), params(1))
        .await;
    assert!(matches!(res, Err(FederationErr::Config(_))));
}
