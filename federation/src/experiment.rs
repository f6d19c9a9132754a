use comms::specs::{
    experiment::{ExperimentSpec, MetricRecord, OptTreatment},
    federation::{ExperimentState, ModelKind},
};
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use log::info;

use crate::{
    FederationErr, Result,
    data::DataInterface,
    device::Device,
    federation::Federation,
    model::ModelInterface,
    report::ExperimentReport,
    simulation::{self, Setup},
    tasks::TaskKeeper,
};

const BEST_METRIC: &str = "acc";

/// How an experiment is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExperimentParams {
    pub rounds: usize,
    pub opt_treatment: OptTreatment,
    /// The device tasks run on, as resolved by `DeviceConfig::apply`.
    pub device: Device,
    /// Seeds the data shuffling of every collaborator, `None` for a random one.
    pub seed: Option<u64>,
}

impl Default for ExperimentParams {
    fn default() -> Self {
        Self {
            rounds: 5,
            opt_treatment: OptTreatment::default(),
            device: Device::default(),
            seed: None,
        }
    }
}

enum Outcome {
    Local {
        report: ExperimentReport,
        best: Vec<f32>,
        last: Vec<f32>,
    },
    Remote,
}

/// Drives one experiment of a federation, from submission to its trained models.
pub struct FlExperiment {
    federation: Federation,
    name: String,
    outcome: Option<Outcome>,
}

impl FlExperiment {
    pub fn new(federation: Federation, name: impl Into<String>) -> Self {
        Self {
            federation,
            name: name.into(),
            outcome: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn federation(&mut self) -> &mut Federation {
        &mut self.federation
    }

    /// Starts the experiment.
    ///
    /// On a local federation the whole experiment runs before returning, on a remote one
    /// it returns as soon as the director accepted it.
    ///
    /// # Arguments
    /// * `model` - The model to train, holding its initial parameters.
    /// * `tasks` - The tasks collaborators run every round.
    /// * `data` - The data interface every collaborator gets a copy of.
    /// * `params` - Rounds and training options.
    pub async fn start<D>(
        &mut self,
        model: ModelInterface,
        tasks: TaskKeeper,
        data: D,
        params: ExperimentParams,
    ) -> Result<()>
    where
        D: DataInterface + Clone + 'static,
    {
        if tasks.is_empty() {
            return Err(FederationErr::Config("no tasks were registered".into()));
        }

        let spec = ExperimentSpec {
            name: self.name.clone(),
            model: model.spec().clone(),
            optimizer: model.optimizer(),
            loss: model.loss(),
            tasks: tasks.specs(),
            rounds: params.rounds,
            opt_treatment: params.opt_treatment,
            best_metric: BEST_METRIC.to_string(),
            seed: params.seed,
        };

        info!(experiment:% = self.name, rounds = params.rounds, params = model.size(); "starting experiment");

        let outcome = match self.federation.local_shards() {
            Some(shards) => {
                let setup = Setup {
                    federation_id: &self.federation.config().federation_id,
                    shards,
                    model: &model,
                    tasks: &tasks,
                    data: &data,
                    device: params.device,
                    seed: params.seed.unwrap_or_else(rand::random),
                };

                let aggregator = simulation::run(setup, spec).await?;

                Outcome::Local {
                    report: aggregator.report(),
                    best: aggregator.best_model().1.to_vec(),
                    last: aggregator.last_model().1.to_vec(),
                }
            }
            None => {
                self.federation
                    .set_new_experiment(spec, model.params())
                    .await?;
                Outcome::Remote
            }
        };

        self.outcome = Some(outcome);
        Ok(())
    }

    /// Waits for the experiment to finish.
    ///
    /// # Returns
    /// The report of every round, or an error if the experiment failed.
    pub async fn wait(&mut self) -> Result<ExperimentReport> {
        match &self.outcome {
            None => Err(FederationErr::NotStarted),
            Some(Outcome::Local { report, .. }) => Ok(report.clone()),
            Some(Outcome::Remote) => {
                let interval = self.federation.config().reconnect_interval();

                loop {
                    let status = self.federation.get_experiment_status(&self.name).await?;

                    match status.state {
                        ExperimentState::Finished => {
                            return Ok(ExperimentReport::from_records(status.records, BEST_METRIC));
                        }
                        ExperimentState::Failed => {
                            return Err(FederationErr::ExperimentFailed(self.name.clone()));
                        }
                        ExperimentState::Pending | ExperimentState::InProgress => {
                            tokio::time::sleep(interval).await;
                        }
                    }
                }
            }
        }
    }

    /// Streams every metric record of the experiment in order, ending once it is over.
    pub fn stream_metrics(&mut self) -> BoxStream<'_, Result<MetricRecord>> {
        match &self.outcome {
            None => stream::iter([Err(FederationErr::NotStarted)]).boxed(),
            Some(Outcome::Local { report, .. }) => {
                stream::iter(report.metrics.clone().into_iter().map(Ok)).boxed()
            }
            Some(Outcome::Remote) => {
                let interval = self.federation.config().reconnect_interval();

                stream::unfold((self, 0, false), move |(exp, seen, over)| async move {
                    if over {
                        return None;
                    }

                    loop {
                        let status = match exp.federation.get_experiment_status(&exp.name).await {
                            Ok(status) => status,
                            Err(e) => return Some((vec![Err(e)], (exp, seen, true))),
                        };

                        let state = status.state;
                        let fresh = status.records.into_iter().skip(seen);
                        let mut batch: Vec<_> = fresh.map(Ok).collect();
                        let seen = seen + batch.len();

                        if state == ExperimentState::Failed {
                            batch.push(Err(FederationErr::ExperimentFailed(exp.name.clone())));
                        }

                        if !batch.is_empty() || state.is_done() {
                            return Some((batch, (exp, seen, state.is_done())));
                        }

                        tokio::time::sleep(interval).await;
                    }
                })
                .flat_map(stream::iter)
                .boxed()
            }
        }
    }

    /// The aggregated model that scored best on validation.
    pub async fn best_model(&mut self) -> Result<Vec<f32>> {
        self.trained_model(ModelKind::Best).await
    }

    /// The model produced by the last round.
    pub async fn last_model(&mut self) -> Result<Vec<f32>> {
        self.trained_model(ModelKind::Last).await
    }

    async fn trained_model(&mut self, kind: ModelKind) -> Result<Vec<f32>> {
        match &self.outcome {
            None => Err(FederationErr::NotStarted),
            Some(Outcome::Local { best, last, .. }) => Ok(match kind {
                ModelKind::Best => best.clone(),
                ModelKind::Last => last.clone(),
            }),
            Some(Outcome::Remote) => {
                let (round, params) = self.federation.get_trained_model(&self.name, kind).await?;
                info!(experiment:% = self.name, round = round; "downloaded trained model");
                Ok(params)
            }
        }
    }
}
