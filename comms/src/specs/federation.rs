use serde::{Deserialize, Serialize};

use super::experiment::MetricRecord;

/// The shapes and description exposed by a shard descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub description: String,
    pub sample_shape: Vec<usize>,
    pub target_shape: Vec<usize>,
}

/// A participant of the federation as listed in the shard registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvoyInfo {
    pub name: String,
    pub shard_info: ShardInfo,
    pub is_online: bool,
    pub is_experiment_running: bool,
    /// Seconds since the unix epoch of the envoy's last health report.
    pub last_updated: u64,
    /// Seconds the last health report is considered valid.
    pub valid_duration: u64,
}

/// The lifecycle of an experiment on the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    Pending,
    InProgress,
    Finished,
    Failed,
}

impl ExperimentState {
    pub fn is_done(&self) -> bool {
        matches!(self, ExperimentState::Finished | ExperimentState::Failed)
    }
}

/// Progress of an experiment, including every metric reported so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentStatus {
    pub name: String,
    pub state: ExperimentState,
    pub round: usize,
    pub records: Vec<MetricRecord>,
}

/// Which of the trained models to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Best,
    Last,
}
