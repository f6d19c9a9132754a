use std::collections::BTreeMap;

use comms::specs::experiment::{MetricRecord, Metrics, RoundPhase};
use serde::{Deserialize, Serialize};

/// The metrics of one task in one round, averaged over collaborators weighted by data size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task: String,
    pub phase: RoundPhase,
    pub data_size: usize,
    pub metrics: Metrics,
}

/// Every task summary of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: usize,
    pub tasks: Vec<TaskSummary>,
}

impl RoundSummary {
    /// The value of `metric` reported by the first task of `phase` that has it.
    pub fn metric(&self, phase: RoundPhase, metric: &str) -> Option<f32> {
        self.tasks
            .iter()
            .filter(|t| t.phase == phase)
            .find_map(|t| t.metrics.get(metric).copied())
    }
}

/// The outcome of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub rounds: Vec<RoundSummary>,
    /// Every record reported by the collaborators, in arrival order.
    pub metrics: Vec<MetricRecord>,
    /// The round whose aggregated model scored best on validation.
    pub best_round: Option<usize>,
    pub best_accuracy: Option<f32>,
    pub best_metric: String,
}

impl ExperimentReport {
    pub fn from_records(metrics: Vec<MetricRecord>, best_metric: &str) -> Self {
        let rounds = summarize(&metrics);
        let best = best_round(&rounds, best_metric);

        Self {
            rounds,
            metrics,
            best_round: best.map(|(round, _)| round),
            best_accuracy: best.map(|(_, score)| score),
            best_metric: best_metric.to_string(),
        }
    }

    /// The validation score after the last round of training, falling back to the last
    /// aggregated model's score when no locally tuned validation ran.
    pub fn final_accuracy(&self) -> Option<f32> {
        let last = self.rounds.last()?;

        last.metric(RoundPhase::LocallyTunedModelValidation, &self.best_metric)
            .or_else(|| last.metric(RoundPhase::AggregatedModelValidation, &self.best_metric))
    }
}

#[derive(Default)]
struct Acc {
    data_size: usize,
    sums: BTreeMap<String, Sums>,
}

#[derive(Default)]
struct Sums {
    weighted: f64,
    weights: f64,
    plain: f64,
    count: usize,
}

impl Sums {
    fn mean(&self) -> f32 {
        if self.weights > 0. {
            (self.weighted / self.weights) as f32
        } else {
            (self.plain / self.count.max(1) as f64) as f32
        }
    }
}

/// Averages the records of every round and task, weighting each collaborator by its data
/// size.
pub fn summarize(records: &[MetricRecord]) -> Vec<RoundSummary> {
    let mut rounds: BTreeMap<usize, BTreeMap<(RoundPhase, &str), Acc>> = BTreeMap::new();

    for record in records {
        let acc = rounds
            .entry(record.round)
            .or_default()
            .entry((record.phase, record.task.as_str()))
            .or_default();

        acc.data_size += record.data_size;

        for (name, value) in &record.metrics {
            let sums = acc.sums.entry(name.clone()).or_default();
            sums.weighted += *value as f64 * record.data_size as f64;
            sums.weights += record.data_size as f64;
            sums.plain += *value as f64;
            sums.count += 1;
        }
    }

    rounds
        .into_iter()
        .map(|(round, tasks)| RoundSummary {
            round,
            tasks: tasks
                .into_iter()
                .map(|((phase, task), acc)| TaskSummary {
                    task: task.to_string(),
                    phase,
                    data_size: acc.data_size,
                    metrics: acc
                        .sums
                        .into_iter()
                        .map(|(name, sums)| (name, sums.mean()))
                        .collect(),
                })
                .collect(),
        })
        .collect()
}

/// Finds the round whose aggregated model validated with the highest `metric`, earliest
/// first on ties.
pub fn best_round(rounds: &[RoundSummary], metric: &str) -> Option<(usize, f32)> {
    rounds
        .iter()
        .filter_map(|r| {
            r.metric(RoundPhase::AggregatedModelValidation, metric)
                .map(|score| (r.round, score))
        })
        .fold(None, |best, (round, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((round, score)),
        })
}
