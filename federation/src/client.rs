use std::time::Duration;

use comms::{
    msg::{Command, Payload},
    specs::{
        experiment::{Metrics, RoundTask},
        federation::ExperimentStatus,
    },
};
use log::debug;

use crate::{
    FederationErr, Result,
    link::{Connector, Identity, Link, RetryPolicy},
};

/// The id aggregators answer as.
pub const AGGREGATOR_ID: &str = "aggregator";

/// The work handed to a collaborator by `get_tasks`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub round: usize,
    pub tasks: Vec<RoundTask>,
    /// How long to wait before asking again when `tasks` is empty.
    pub sleep: Duration,
    pub quit: bool,
}

/// A collaborator's link to the aggregator of its experiment.
pub struct AggregatorClient {
    link: Link,
}

impl AggregatorClient {
    /// Creates a new `AggregatorClient`.
    ///
    /// # Arguments
    /// * `connector` - Opens connections to the aggregator.
    /// * `collaborator` - The name we present ourselves with.
    /// * `federation_id` - The federation both ends belong to.
    pub fn new(
        connector: impl Connector + 'static,
        collaborator: impl Into<String>,
        federation_id: impl Into<String>,
    ) -> Self {
        let identity = Identity {
            name: collaborator.into(),
            peer: AGGREGATOR_ID.to_string(),
            federation_id: federation_id.into(),
            cert_common_name: String::new(),
        };

        Self {
            link: Link::new(connector, identity),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.link = self.link.with_retry(retry);
        self
    }

    /// Opens a fresh connection for every call.
    pub fn atomic(mut self, atomic: bool) -> Self {
        self.link = self.link.atomic(atomic);
        self
    }

    pub fn collaborator(&self) -> &str {
        &self.link.identity().name
    }

    pub async fn connectivity_check(&mut self) -> Result<()> {
        match self.link.call(Command::ConnectivityCheck, None).await? {
            Command::Ack => Ok(()),
            other => unexpected("ack", other),
        }
    }

    /// Asks for the tasks of the current round.
    pub async fn get_tasks(&mut self) -> Result<Assignment> {
        match self.link.call(Command::GetTasks, None).await? {
            Command::Tasks {
                round,
                tasks,
                sleep_ms,
                quit,
            } => {
                debug!(round = round, tasks = tasks.len(), quit = quit; "received tasks");
                Ok(Assignment {
                    round,
                    tasks,
                    sleep: Duration::from_millis(sleep_ms),
                    quit,
                })
            }
            other => unexpected("tasks", other),
        }
    }

    /// Downloads the aggregated model of `round`.
    pub async fn get_aggregated_model(&mut self, round: usize) -> Result<Vec<f32>> {
        let (reply, params) = self
            .link
            .call_for_model(Command::GetAggregatedModel { round })
            .await?;

        match reply {
            Command::AggregatedModel { round: got } if got == round => Ok(params),
            Command::AggregatedModel { round: got } => Err(FederationErr::RoundMismatch {
                got,
                expected: round,
            }),
            other => unexpected("aggregated model", other),
        }
    }

    /// Reports the results of one task, `update` carries the parameters a training task
    /// produced.
    pub async fn send_local_task_results(
        &mut self,
        round: usize,
        task: RoundTask,
        data_size: usize,
        metrics: Metrics,
        update: Option<&[f32]>,
    ) -> Result<()> {
        let command = Command::TaskResults {
            round,
            task,
            data_size,
            metrics,
            has_model: update.is_some(),
        };

        let payload = update.map(Payload::LocalUpdate);
        match self.link.call(command, payload).await? {
            Command::Ack => Ok(()),
            other => unexpected("ack", other),
        }
    }

    /// Lets `collaborator` join the experiment from the current round on.
    pub async fn admin_add_collaborator(&mut self, collaborator: &str) -> Result<()> {
        let command = Command::AddCollaborator {
            name: collaborator.to_string(),
        };

        match self.link.call(command, None).await? {
            Command::Ack => Ok(()),
            other => unexpected("ack", other),
        }
    }

    /// Drops `collaborator` from the experiment, rounds stop waiting for it.
    pub async fn admin_remove_collaborator(&mut self, collaborator: &str) -> Result<()> {
        let command = Command::RemoveCollaborator {
            name: collaborator.to_string(),
        };

        match self.link.call(command, None).await? {
            Command::Ack => Ok(()),
            other => unexpected("ack", other),
        }
    }

    /// Tells the aggregator we are leaving and closes the link.
    pub async fn disconnect(&mut self) -> Result<()> {
        debug!(collaborator:% = self.collaborator(); "disconnecting from the aggregator");
        self.link.close(Command::Disconnect).await
    }

    pub async fn get_experiment_status(&mut self, name: &str) -> Result<ExperimentStatus> {
        let command = Command::GetExperimentStatus {
            name: name.to_string(),
        };

        match self.link.call(command, None).await? {
            Command::ExperimentStatus { status } => Ok(status),
            other => unexpected("experiment status", other),
        }
    }
}

pub(crate) fn unexpected<T>(expected: &'static str, got: Command) -> Result<T> {
    Err(FederationErr::UnexpectedMessage {
        expected,
        got: format!("{got:?}"),
    })
}
