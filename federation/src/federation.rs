use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use comms::{
    msg::{Command, Payload},
    specs::{
        experiment::ExperimentSpec,
        federation::{EnvoyInfo, ExperimentStatus, ModelKind},
    },
};
use log::{info, warn};

use crate::{
    FederationErr, Result,
    client::unexpected,
    config::FederationConfig,
    link::{Connector, Identity, Link, RetryPolicy, TcpConnector},
    shard::{DummyShardDescriptor, ShardDescriptor},
};

/// The id directors answer as.
pub const DIRECTOR_ID: &str = "director";

/// Seconds a local envoy's registry entry is considered fresh.
const LOCAL_VALID_DURATION: u64 = 60;

enum Backend {
    Remote(Link),
    Local(Vec<(String, Arc<dyn ShardDescriptor>)>),
}

/// A handle to a federation: either a remote director or a set of local shards simulated
/// in process.
pub struct Federation {
    config: FederationConfig,
    backend: Backend,
}

impl Federation {
    /// Connects to the director described by `config`.
    ///
    /// # Returns
    /// An error if the director cannot be reached or secure transport was requested.
    pub async fn connect(config: FederationConfig) -> Result<Self> {
        if config.tls {
            warn!(director:% = config.director_addr(); "tls was requested but is not available");
            return Err(FederationErr::Unsupported("secure transport"));
        }

        let connector = TcpConnector::new(config.director_addr());
        Self::connect_with(config, connector).await
    }

    /// Same as `connect` but opening connections through `connector`.
    pub async fn connect_with(
        config: FederationConfig,
        connector: impl Connector + 'static,
    ) -> Result<Self> {
        let identity = Identity {
            name: config.client_id.clone(),
            peer: DIRECTOR_ID.to_string(),
            federation_id: config.federation_id.clone(),
            cert_common_name: config.cert_common_name.clone(),
        };

        let retry = RetryPolicy {
            interval: config.reconnect_interval(),
            max_attempts: config.max_reconnect_attempts,
        };

        let mut link = Link::new(connector, identity).with_retry(retry);

        match link.call(Command::ConnectivityCheck, None).await? {
            Command::Ack => {}
            other => return unexpected("ack", other),
        }

        info!(director:% = config.director_addr(), client:% = config.client_id; "connected to director");

        Ok(Self {
            config,
            backend: Backend::Remote(link),
        })
    }

    /// Creates a federation simulated in process over `shards`, named `envoy_1`, `envoy_2`...
    pub fn local(shards: Vec<Arc<dyn ShardDescriptor>>) -> Self {
        let shards = shards
            .into_iter()
            .enumerate()
            .map(|(i, shard)| (format!("envoy_{}", i + 1), shard))
            .collect();

        Self {
            config: FederationConfig::default(),
            backend: Backend::Local(shards),
        }
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local(_))
    }

    /// Lists the envoys of the federation and the shards they hold.
    pub async fn shard_registry(&mut self) -> Result<Vec<EnvoyInfo>> {
        let link = match &mut self.backend {
            Backend::Local(shards) => return Ok(local_registry(shards)),
            Backend::Remote(link) => link,
        };

        match link.call(Command::GetShardRegistry, None).await? {
            Command::ShardRegistry { envoys } => Ok(envoys),
            other => unexpected("shard registry", other),
        }
    }

    /// A zero filled shard with the shapes of the first envoy of the registry.
    pub async fn dummy_shard_descriptor(&mut self, size: usize) -> Result<DummyShardDescriptor> {
        let registry = self.shard_registry().await?;
        let Some(envoy) = registry.first() else {
            return Err(FederationErr::EmptyRegistry);
        };

        Ok(DummyShardDescriptor::from_info(&envoy.shard_info, size))
    }

    pub(crate) fn local_shards(&self) -> Option<&[(String, Arc<dyn ShardDescriptor>)]> {
        match &self.backend {
            Backend::Local(shards) => Some(shards),
            Backend::Remote(_) => None,
        }
    }

    fn director(&mut self) -> Result<&mut Link> {
        match &mut self.backend {
            Backend::Remote(link) => Ok(link),
            Backend::Local(_) => Err(FederationErr::Unsupported("a local director")),
        }
    }

    /// Submits a new experiment starting from `params`.
    pub(crate) async fn set_new_experiment(
        &mut self,
        spec: ExperimentSpec,
        params: &[f32],
    ) -> Result<()> {
        let command = Command::SetNewExperiment { spec };

        let payload = Some(Payload::Model(params));
        match self.director()?.call(command, payload).await? {
            Command::Ack => Ok(()),
            other => unexpected("ack", other),
        }
    }

    pub(crate) async fn get_experiment_status(&mut self, name: &str) -> Result<ExperimentStatus> {
        let command = Command::GetExperimentStatus {
            name: name.to_string(),
        };

        match self.director()?.call(command, None).await? {
            Command::ExperimentStatus { status } => Ok(status),
            other => unexpected("experiment status", other),
        }
    }

    pub(crate) async fn get_trained_model(
        &mut self,
        name: &str,
        kind: ModelKind,
    ) -> Result<(usize, Vec<f32>)> {
        let command = Command::GetTrainedModel {
            name: name.to_string(),
            kind,
        };

        match self.director()?.call_for_model(command).await? {
            (Command::TrainedModel { round }, params) => Ok((round, params)),
            (other, _) => unexpected("trained model", other),
        }
    }
}

fn local_registry(shards: &[(String, Arc<dyn ShardDescriptor>)]) -> Vec<EnvoyInfo> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    shards
        .iter()
        .map(|(name, shard)| EnvoyInfo {
            name: name.clone(),
            shard_info: shard.shard_info(),
            is_online: true,
            is_experiment_running: false,
            last_updated: now,
            valid_duration: LOCAL_VALID_DURATION,
        })
        .collect()
}
