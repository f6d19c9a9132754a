use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::{LossFnSpec, ModelSpec, OptimizerSpec};

/// Named scalar results reported by a task.
pub type Metrics = BTreeMap<String, f32>;

/// Whether a task changes the model or only measures it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Train,
    Validate,
}

/// How the results of a training task are combined across collaborators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationSpec {
    #[default]
    WeightedAverage,
    Median,
}

/// What happens to the collaborators' optimizer state between rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptTreatment {
    #[default]
    Reset,
    ContinueLocal,
}

/// A registered task as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub aggregation: AggregationSpec,
    #[serde(default)]
    pub kwargs: BTreeMap<String, serde_json::Value>,
}

/// The point of a round at which a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    AggregatedModelValidation,
    Train,
    LocallyTunedModelValidation,
}

impl RoundPhase {
    /// The label used for this phase in metric reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::AggregatedModelValidation => "aggregated_model_validation",
            RoundPhase::Train => "train",
            RoundPhase::LocallyTunedModelValidation => "locally_tuned_model_validation",
        }
    }
}

/// One task a collaborator has to run in the current round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundTask {
    pub task: String,
    pub phase: RoundPhase,
}

/// Everything the orchestrator needs to run an experiment, minus the initial parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub name: String,
    pub model: ModelSpec,
    pub optimizer: OptimizerSpec,
    pub loss: LossFnSpec,
    pub tasks: Vec<TaskSpec>,
    pub rounds: usize,
    #[serde(default)]
    pub opt_treatment: OptTreatment,
    #[serde(default = "default_best_metric")]
    pub best_metric: String,
    pub seed: Option<u64>,
}

fn default_best_metric() -> String {
    "acc".to_string()
}

impl ExperimentSpec {
    /// The ordered list of tasks every collaborator runs in a round.
    ///
    /// Validation tasks run on the aggregated model before training and on
    /// the locally tuned model after it.
    pub fn round_tasks(&self) -> Vec<RoundTask> {
        let of_kind = |kind: TaskKind, phase: RoundPhase| {
            self.tasks
                .iter()
                .filter(move |t| t.kind == kind)
                .map(move |t| RoundTask {
                    task: t.name.clone(),
                    phase,
                })
        };

        of_kind(TaskKind::Validate, RoundPhase::AggregatedModelValidation)
            .chain(of_kind(TaskKind::Train, RoundPhase::Train))
            .chain(of_kind(
                TaskKind::Validate,
                RoundPhase::LocallyTunedModelValidation,
            ))
            .collect()
    }

    /// Finds a task by name.
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// A metrics report of one collaborator for one task of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub round: usize,
    pub collaborator: String,
    pub task: String,
    pub phase: RoundPhase,
    /// The amount of samples the task ran over, used to weight the record.
    pub data_size: usize,
    pub metrics: Metrics,
}
