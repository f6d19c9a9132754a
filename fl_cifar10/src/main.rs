use std::{env, io, sync::Arc};

use comms::specs::experiment::{OptTreatment, RoundPhase};
use federation::{
    DeviceConfig, ExperimentParams, Federation, FederationConfig, FlExperiment, Result,
    ShardDescriptor,
};
use fl_cifar10::{Cifar10Data, Cifar10ShardDescriptor, TrainingConfig, net, tasks};
use log::info;
use tokio::signal;

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let device = DeviceConfig::from_env()?.apply()?;
    let config = TrainingConfig::from_env()?;

    tokio::select! {
        ret = run(config, device) => ret?,
        _ = signal::ctrl_c() => info!("received SIGINT, stopping"),
    }

    Ok(())
}

async fn run(config: TrainingConfig, device: federation::Device) -> Result<()> {
    let mut federation = match env::var("FL_DIRECTOR_HOST") {
        Ok(_) => Federation::connect(FederationConfig::from_env()?).await?,
        Err(_) => local_federation(&config)?,
    };

    let registry = federation.shard_registry().await?;
    println!("shard registry:");
    for envoy in &registry {
        let info = &envoy.shard_info;
        println!(
            "  {}: {} (samples {:?}, targets {:?})",
            envoy.name, info.description, info.sample_shape, info.target_shape
        );
    }

    let model = net::cnn_model(&config)?;
    let tasks = tasks::task_keeper(config.epochs)?;
    let data = Cifar10Data::new(config.train_batch_size, config.valid_batch_size)?;

    let params = ExperimentParams {
        rounds: config.rounds,
        opt_treatment: OptTreatment::Reset,
        device,
        seed: config.seed,
    };

    let mut experiment = FlExperiment::new(federation, config.experiment_name.clone());
    experiment.start(model, tasks, data, params).await?;
    let report = experiment.wait().await?;

    for round in &report.rounds {
        let aggregated = round.metric(RoundPhase::AggregatedModelValidation, "acc");
        let tuned = round.metric(RoundPhase::LocallyTunedModelValidation, "acc");
        println!(
            "round {}: aggregated acc {}, locally tuned acc {}",
            round.round,
            fmt_acc(aggregated),
            fmt_acc(tuned)
        );
    }

    if let Some(best) = report.best_round {
        println!("best round: {best}");
    }
    println!("final accuracy: {}", fmt_acc(report.final_accuracy()));

    Ok(())
}

fn local_federation(config: &TrainingConfig) -> Result<Federation> {
    let shards = (1..=config.shards)
        .map(|rank| -> Result<Arc<dyn ShardDescriptor>> {
            let shard = Cifar10ShardDescriptor::new(&config.data_dir, rank, config.shards)?
                .with_limit(config.shard_limit);
            Ok(Arc::new(shard))
        })
        .collect::<Result<Vec<_>>>()?;

    info!(shards = shards.len(), data:% = config.data_dir.display(); "simulating federation locally");
    Ok(Federation::local(shards))
}

fn fmt_acc(acc: Option<f32>) -> String {
    acc.map_or_else(|| "-".to_string(), |acc| format!("{acc:.4}"))
}
