use std::sync::Arc;

use comms::specs::experiment::{Metrics, OptTreatment, RoundPhase, RoundTask, TaskKind};
use log::{debug, info, warn};
use machine_learning::training::TrainingState;

use crate::{
    FederationErr, Result,
    client::AggregatorClient,
    data::DataInterface,
    device::Device,
    model::ModelInterface,
    shard::ShardDescriptor,
    tasks::{TaskContext, TaskKeeper},
};

/// A participant of an experiment: runs the tasks the aggregator hands out on its local
/// shard and reports their results.
pub struct Collaborator<D> {
    name: String,
    model: ModelInterface,
    tasks: TaskKeeper,
    data: Arc<D>,
    opt_treatment: OptTreatment,
    device: Device,
    seed: u64,
}

impl<D: DataInterface + 'static> Collaborator<D> {
    /// Creates a new `Collaborator`, binding `data` to `shard`.
    ///
    /// # Arguments
    /// * `name` - The name the collaborator reports as.
    /// * `model` - The model definition, its parameters are replaced every round.
    /// * `tasks` - The tasks the aggregator may ask for.
    /// * `data` - The collaborator's own copy of the data interface.
    /// * `shard` - The local shard.
    pub fn new(
        name: impl Into<String>,
        model: ModelInterface,
        tasks: TaskKeeper,
        mut data: D,
        shard: Arc<dyn ShardDescriptor>,
    ) -> Result<Self> {
        data.set_shard_descriptor(shard)?;

        Ok(Self {
            name: name.into(),
            model,
            tasks,
            data: Arc::new(data),
            opt_treatment: OptTreatment::default(),
            device: Device::default(),
            seed: rand::random(),
        })
    }

    pub fn with_opt_treatment(mut self, opt_treatment: OptTreatment) -> Self {
        self.opt_treatment = opt_treatment;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Works through the experiment until the aggregator says to quit.
    ///
    /// # Returns
    /// The amount of rounds the collaborator took part in.
    pub async fn run(&self, client: &mut AggregatorClient) -> Result<usize> {
        let mut state: Option<TrainingState> = None;
        let mut rounds = 0;

        loop {
            let assignment = client.get_tasks().await?;

            if assignment.quit {
                info!(collaborator:% = self.name, rounds = rounds; "experiment over, quitting");

                if let Err(e) = client.disconnect().await {
                    warn!(collaborator:% = self.name, error:% = e; "could not disconnect cleanly");
                }

                return Ok(rounds);
            }

            if assignment.tasks.is_empty() {
                tokio::time::sleep(assignment.sleep).await;
                continue;
            }

            let round = assignment.round;
            info!(collaborator:% = self.name, round = round; "starting round");

            let params = client.get_aggregated_model(round).await?;
            let mut current = self.prepare_state(state.take(), params)?;

            for task in assignment.tasks {
                let (next, metrics, kind) = self.run_task(current, round, &task).await?;
                current = next;

                let (data_size, update) = match kind {
                    TaskKind::Train => (self.data.train_data_size(), Some(current.params())),
                    TaskKind::Validate => (self.data.valid_data_size(), None),
                };

                client
                    .send_local_task_results(round, task, data_size, metrics, update)
                    .await?;
            }

            state = Some(current);
            rounds += 1;
        }
    }

    fn prepare_state(
        &self,
        state: Option<TrainingState>,
        params: Vec<f32>,
    ) -> Result<TrainingState> {
        match state {
            Some(mut state) => {
                state.set_params(&params)?;

                if self.opt_treatment == OptTreatment::Reset {
                    state.reset_optimizer();
                }

                Ok(state)
            }
            None => {
                let mut model = self.model.clone();
                model.set_params(params)?;
                model.training_state()
            }
        }
    }

    async fn run_task(
        &self,
        mut state: TrainingState,
        round: usize,
        task: &RoundTask,
    ) -> Result<(TrainingState, Metrics, TaskKind)> {
        let (Some(spec), Some(runner)) = (self.tasks.spec(&task.task), self.tasks.get(&task.task))
        else {
            return Err(FederationErr::UnknownTask(task.task.clone()));
        };

        if (spec.kind == TaskKind::Train) != (task.phase == RoundPhase::Train) {
            return Err(FederationErr::UnexpectedMessage {
                expected: "a task matching its phase",
                got: format!("{} during {}", task.task, task.phase.as_str()),
            });
        }

        let kind = spec.kind;
        let kwargs = spec.kwargs.clone();
        let data = self.data.clone();
        let device = self.device;
        let seed = self.seed.wrapping_add(round as u64);

        debug!(
            collaborator:% = self.name,
            round = round,
            task:% = task.task,
            phase = task.phase.as_str();
            "running task"
        );

        tokio::task::spawn_blocking(move || -> Result<(TrainingState, Metrics, TaskKind)> {
            let ctx = TaskContext {
                state: &mut state,
                data: data.as_ref(),
                device,
                kwargs: &kwargs,
                seed,
            };

            let metrics = runner.run(ctx)?;
            Ok((state, metrics, kind))
        })
        .await?
    }
}
