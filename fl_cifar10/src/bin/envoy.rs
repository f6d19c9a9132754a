use std::{env, io, sync::Arc};

use federation::{
    AggregatorClient, Collaborator, DeviceConfig, FederationConfig, FederationErr, Result,
    ShardDescriptor,
    link::{RetryPolicy, TcpConnector},
};
use fl_cifar10::{Cifar10Data, Cifar10ShardDescriptor, TrainingConfig, net, tasks};
use log::info;
use tokio::signal;

const DEFAULT_AGGREGATOR_ADDR: &str = "localhost:50052";

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let device = DeviceConfig::from_env()?.apply()?;
    let training = TrainingConfig::from_env()?;
    let link_config = FederationConfig::from_env()?;

    tokio::select! {
        ret = run(training, link_config, device) => {
            let rounds = ret?;
            info!(rounds = rounds; "experiment over, disconnecting");
        }
        _ = signal::ctrl_c() => info!("received SIGINT, stopping"),
    }

    Ok(())
}

async fn run(
    training: TrainingConfig,
    link_config: FederationConfig,
    device: federation::Device,
) -> Result<usize> {
    let rank = match env::var("FL_SHARD_RANK") {
        Ok(rank) => rank
            .trim()
            .parse()
            .map_err(|e| FederationErr::Config(format!("invalid FL_SHARD_RANK '{rank}': {e}")))?,
        Err(_) => 1,
    };
    let addr = env::var("FL_AGGREGATOR_ADDR")
        .unwrap_or_else(|_| DEFAULT_AGGREGATOR_ADDR.to_string());

    let shard = Cifar10ShardDescriptor::new(&training.data_dir, rank, training.shards)?
        .with_limit(training.shard_limit);
    info!(
        envoy:% = link_config.client_id,
        aggregator:% = addr,
        shard:% = shard.description();
        "starting envoy"
    );

    let data = Cifar10Data::new(training.train_batch_size, training.valid_batch_size)?;
    let model = net::cnn_model(&training)?;
    let tasks = tasks::task_keeper(training.epochs)?;

    let mut collaborator = Collaborator::new(
        link_config.client_id.clone(),
        model,
        tasks,
        data,
        Arc::new(shard),
    )?
    .with_device(device);

    if let Some(seed) = training.seed {
        collaborator = collaborator.with_seed(seed);
    }

    let retry = RetryPolicy {
        interval: link_config.reconnect_interval(),
        max_attempts: link_config.max_reconnect_attempts,
    };
    let mut client = AggregatorClient::new(
        TcpConnector::new(addr),
        link_config.client_id,
        link_config.federation_id,
    )
    .with_retry(retry);

    client.connectivity_check().await?;
    collaborator.run(&mut client).await
}
