use std::collections::{BTreeSet, HashMap};

use comms::specs::{
    experiment::{
        AggregationSpec, ExperimentSpec, MetricRecord, Metrics, RoundPhase, RoundTask, TaskKind,
    },
    federation::{ExperimentState, ExperimentStatus},
};
use log::{debug, info, warn};
use machine_learning::arch::ModelBuilder;

use crate::{
    FederationErr, Result,
    aggregation::{self, LocalUpdate},
    client::Assignment,
    report::{ExperimentReport, summarize},
};

/// How long collaborators that are done with a round wait before asking again.
const ROUND_SLEEP_MS: u64 = 10;

struct Update {
    data_size: usize,
    params: Vec<f32>,
    aggregation: AggregationSpec,
}

/// The round bookkeeping of a running experiment: which collaborator still owes which task,
/// the local updates of the round and the global model they are folded into.
pub struct Aggregator {
    spec: ExperimentSpec,
    collaborators: Vec<String>,
    removed: BTreeSet<String>,
    round_tasks: Vec<RoundTask>,
    round: usize,
    model: Vec<f32>,
    completed: HashMap<String, BTreeSet<usize>>,
    updates: HashMap<String, Update>,
    records: Vec<MetricRecord>,
    best: Option<(usize, f32, Vec<f32>)>,
    state: ExperimentState,
}

impl Aggregator {
    /// Creates a new `Aggregator`.
    ///
    /// # Arguments
    /// * `spec` - The experiment to run.
    /// * `collaborators` - The names of every participant.
    /// * `initial` - The parameters of the model before the first round.
    ///
    /// # Returns
    /// An error if the model is invalid, `initial` does not fit it or nobody has work to do.
    pub fn new(
        spec: ExperimentSpec,
        collaborators: Vec<String>,
        initial: Vec<f32>,
    ) -> Result<Self> {
        let expected = ModelBuilder::new().build(&spec.model)?.size();

        if initial.len() != expected {
            return Err(FederationErr::ModelSizeMismatch {
                got: initial.len(),
                expected,
            });
        }

        if collaborators.is_empty() {
            return Err(FederationErr::Config("the experiment has no collaborators".into()));
        }

        let round_tasks = spec.round_tasks();
        if round_tasks.is_empty() {
            return Err(FederationErr::Config("the experiment has no tasks".into()));
        }

        let state = if spec.rounds == 0 {
            ExperimentState::Finished
        } else {
            ExperimentState::InProgress
        };

        Ok(Self {
            spec,
            collaborators,
            removed: BTreeSet::new(),
            round_tasks,
            round: 0,
            model: initial,
            completed: HashMap::new(),
            updates: HashMap::new(),
            records: Vec::new(),
            best: None,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn round(&self) -> usize {
        self.round
    }

    pub fn collaborators(&self) -> &[String] {
        &self.collaborators
    }

    pub fn is_done(&self) -> bool {
        self.state.is_done()
    }

    /// Lets `name` take part, starting with the tasks of the current round.
    pub fn add_collaborator(&mut self, name: &str) -> Result<()> {
        if self.is_done() {
            return Err(FederationErr::Config(format!(
                "experiment '{}' is over, '{name}' cannot join",
                self.spec.name
            )));
        }

        if !self.collaborators.iter().any(|c| c == name) {
            self.collaborators.push(name.to_string());
        }

        self.removed.remove(name);
        info!(experiment:% = self.spec.name, collaborator:% = name; "collaborator added");
        Ok(())
    }

    /// Stops waiting for `name`, its results of the current round are discarded and the
    /// round closes if everybody else is done.
    pub fn remove_collaborator(&mut self, name: &str) -> Result<()> {
        self.check_collaborator(name)?;

        if self.collaborators.len() == 1 {
            return Err(FederationErr::Config(format!(
                "cannot remove '{name}', the experiment would have no collaborators"
            )));
        }

        let round = self.round;
        self.collaborators.retain(|c| c != name);
        self.completed.remove(name);
        self.updates.remove(name);
        self.records
            .retain(|r| r.round != round || r.collaborator != name);
        self.removed.insert(name.to_string());
        info!(experiment:% = self.spec.name, collaborator:% = name; "collaborator removed");

        if !self.is_done() && self.round_complete() {
            self.end_round()?;
        }

        Ok(())
    }

    /// The tasks `collaborator` still owes for the current round.
    pub fn tasks_for(&self, collaborator: &str) -> Result<Assignment> {
        if self.removed.contains(collaborator) {
            return Ok(Assignment {
                round: self.round,
                tasks: Vec::new(),
                sleep: Default::default(),
                quit: true,
            });
        }

        self.check_collaborator(collaborator)?;

        if self.is_done() {
            return Ok(Assignment {
                round: self.round,
                tasks: Vec::new(),
                sleep: Default::default(),
                quit: true,
            });
        }

        let completed = self.completed.get(collaborator);
        let tasks = self
            .round_tasks
            .iter()
            .enumerate()
            .filter(|(i, _)| !completed.is_some_and(|c| c.contains(i)))
            .map(|(_, t)| t.clone())
            .collect();

        Ok(Assignment {
            round: self.round,
            tasks,
            sleep: std::time::Duration::from_millis(ROUND_SLEEP_MS),
            quit: false,
        })
    }

    /// The global model collaborators start `round` from.
    pub fn model(&self, round: usize) -> Result<&[f32]> {
        if round != self.round || self.is_done() {
            return Err(FederationErr::RoundMismatch {
                got: round,
                expected: self.round,
            });
        }

        Ok(&self.model)
    }

    /// Records the results of one task, closing the round once every collaborator reported
    /// every task.
    pub fn submit(
        &mut self,
        collaborator: &str,
        round: usize,
        task: &RoundTask,
        data_size: usize,
        metrics: Metrics,
        update: Option<&[f32]>,
    ) -> Result<()> {
        if self.removed.contains(collaborator) {
            warn!(
                collaborator:% = collaborator,
                round = round;
                "ignoring results of a removed collaborator"
            );
            return Ok(());
        }

        self.check_collaborator(collaborator)?;

        if round != self.round || self.is_done() {
            return Err(FederationErr::RoundMismatch {
                got: round,
                expected: self.round,
            });
        }

        let Some(index) = self.round_tasks.iter().position(|t| t == task) else {
            return Err(FederationErr::UnknownTask(task.task.clone()));
        };

        // SAFETY: every round task comes from one of the experiment's tasks.
        let spec = self.spec.task(&task.task).unwrap();
        let (kind, aggregation) = (spec.kind, spec.aggregation);

        let completed = self.completed.get(collaborator);
        if completed.is_some_and(|c| c.contains(&index)) {
            warn!(
                collaborator:% = collaborator,
                round = round,
                task:% = task.task;
                "ignoring repeated task results"
            );
            return Ok(());
        }

        if kind == TaskKind::Train {
            let Some(params) = update else {
                return Err(FederationErr::UnexpectedMessage {
                    expected: "local update",
                    got: "results without a model".to_string(),
                });
            };

            if params.len() != self.model.len() {
                return Err(FederationErr::ModelSizeMismatch {
                    got: params.len(),
                    expected: self.model.len(),
                });
            }

            self.updates.insert(
                collaborator.to_string(),
                Update {
                    data_size,
                    params: params.to_vec(),
                    aggregation,
                },
            );
        }

        debug!(
            collaborator:% = collaborator,
            round = round,
            task:% = task.task,
            phase = task.phase.as_str();
            "received task results"
        );

        self.records.push(MetricRecord {
            round,
            collaborator: collaborator.to_string(),
            task: task.task.clone(),
            phase: task.phase,
            data_size,
            metrics,
        });

        self.completed
            .entry(collaborator.to_string())
            .or_default()
            .insert(index);

        if self.round_complete() {
            self.end_round()?;
        }

        Ok(())
    }

    fn round_complete(&self) -> bool {
        self.collaborators.iter().all(|c| {
            self.completed
                .get(c)
                .is_some_and(|done| done.len() == self.round_tasks.len())
        })
    }

    fn end_round(&mut self) -> Result<()> {
        let records: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.round == self.round)
            .cloned()
            .collect();

        let score = summarize(&records).first().and_then(|summary| {
            summary.metric(RoundPhase::AggregatedModelValidation, &self.spec.best_metric)
        });

        if let Some(score) = score {
            if self.best.as_ref().is_none_or(|(_, best, _)| score > *best) {
                self.best = Some((self.round, score, self.model.clone()));
            }
        }

        let updates: Vec<_> = self
            .collaborators
            .iter()
            .filter_map(|c| self.updates.get(c))
            .collect();

        if let Some(first) = updates.first() {
            let local: Vec<_> = updates
                .iter()
                .map(|u| LocalUpdate {
                    weight: u.data_size,
                    params: &u.params,
                })
                .collect();

            self.model = aggregation::aggregate(first.aggregation, &local)?;
        }

        info!(
            experiment:% = self.spec.name,
            round = self.round,
            updates = updates.len(),
            score = score.unwrap_or(f32::NAN);
            "round finished"
        );

        self.updates.clear();
        self.completed.clear();
        self.round += 1;

        if self.round >= self.spec.rounds {
            self.state = ExperimentState::Finished;
            info!(experiment:% = self.spec.name; "experiment finished");
        }

        Ok(())
    }

    /// Marks the experiment as failed, collaborators are told to quit.
    pub fn fail(&mut self) {
        self.state = ExperimentState::Failed;
    }

    pub fn status(&self) -> ExperimentStatus {
        ExperimentStatus {
            name: self.spec.name.clone(),
            state: self.state,
            round: self.round,
            records: self.records.clone(),
        }
    }

    pub fn report(&self) -> ExperimentReport {
        ExperimentReport::from_records(self.records.clone(), &self.spec.best_metric)
    }

    /// The aggregated model that validated best together with its round, the initial model
    /// if no validation ran.
    pub fn best_model(&self) -> (usize, &[f32]) {
        match &self.best {
            Some((round, _, params)) => (*round, params),
            None => (0, &self.model),
        }
    }

    /// The model produced by the last finished round.
    pub fn last_model(&self) -> (usize, &[f32]) {
        (self.round, &self.model)
    }

    fn check_collaborator(&self, name: &str) -> Result<()> {
        if !self.collaborators.iter().any(|c| c == name) {
            return Err(FederationErr::UnknownCollaborator(name.to_string()));
        }

        Ok(())
    }
}
