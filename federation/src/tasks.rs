use std::{collections::BTreeMap, sync::Arc};

use comms::specs::experiment::{AggregationSpec, Metrics, TaskKind, TaskSpec};
use machine_learning::training::TrainingState;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{FederationErr, Result, data::DataInterface, device::Device};

/// Everything a task gets to work with.
pub struct TaskContext<'a> {
    /// The model under training, with the parameters the task should start from.
    pub state: &'a mut TrainingState,
    pub data: &'a dyn DataInterface,
    pub device: Device,
    pub kwargs: &'a BTreeMap<String, Value>,
    /// Seeds anything random the task does, it changes every round.
    pub seed: u64,
}

impl TaskContext<'_> {
    /// Reads the keyword argument `key`.
    ///
    /// # Returns
    /// `None` if it was not given, an error if it does not deserialize into `T`.
    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.kwargs
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(FederationErr::from)
    }
}

/// A unit of work collaborators run on their local data.
pub trait Task: Send + Sync {
    fn run(&self, ctx: TaskContext<'_>) -> Result<Metrics>;
}

impl<F> Task for F
where
    F: Fn(TaskContext<'_>) -> Result<Metrics> + Send + Sync,
{
    fn run(&self, ctx: TaskContext<'_>) -> Result<Metrics> {
        self(ctx)
    }
}

#[derive(Clone)]
struct Registered {
    spec: TaskSpec,
    task: Arc<dyn Task>,
}

/// The registry of named tasks of an experiment, in registration order.
#[derive(Clone, Default)]
pub struct TaskKeeper {
    tasks: Vec<Registered>,
}

impl TaskKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` under `name`.
    ///
    /// # Returns
    /// An error if the name is already taken.
    pub fn register<T>(&mut self, name: impl Into<String>, kind: TaskKind, task: T) -> Result<()>
    where
        T: Task + 'static,
    {
        let name = name.into();

        if self.position(&name).is_some() {
            return Err(FederationErr::DuplicateTask(name));
        }

        self.tasks.push(Registered {
            spec: TaskSpec {
                name,
                kind,
                aggregation: AggregationSpec::default(),
                kwargs: BTreeMap::new(),
            },
            task: Arc::new(task),
        });

        Ok(())
    }

    /// Adds keyword arguments handed to every run of the task `name`.
    pub fn add_kwargs<I, K>(&mut self, name: &str, kwargs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let spec = self.spec_mut(name)?;
        spec.kwargs
            .extend(kwargs.into_iter().map(|(k, v)| (k.into(), v)));
        Ok(())
    }

    /// Sets how the results of the task `name` are combined across collaborators.
    pub fn set_aggregation(&mut self, name: &str, aggregation: AggregationSpec) -> Result<()> {
        self.spec_mut(name)?.aggregation = aggregation;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.position(name).map(|i| self.tasks[i].task.clone())
    }

    pub fn spec(&self, name: &str) -> Option<&TaskSpec> {
        self.position(name).map(|i| &self.tasks[i].spec)
    }

    /// The registered tasks as the orchestrator sees them.
    pub fn specs(&self) -> Vec<TaskSpec> {
        self.tasks.iter().map(|t| t.spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.spec.name == name)
    }

    fn spec_mut(&mut self, name: &str) -> Result<&mut TaskSpec> {
        match self.position(name) {
            Some(i) => Ok(&mut self.tasks[i].spec),
            None => Err(FederationErr::UnknownTask(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn noop(_: TaskContext<'_>) -> Result<Metrics> {
        Ok(Metrics::new())
    }

    #[test]
    fn specs_follow_registration_order() {
        let mut keeper = TaskKeeper::new();
        keeper
            .register("validate", TaskKind::Validate, noop)
            .unwrap();
        keeper.register("train", TaskKind::Train, noop).unwrap();

        let names: Vec<_> = keeper.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["validate", "train"]);
        assert_eq!(keeper.spec("train").unwrap().kind, TaskKind::Train);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut keeper = TaskKeeper::new();
        keeper.register("train", TaskKind::Train, noop).unwrap();

        let res = keeper.register("train", TaskKind::Validate, noop);
        assert!(matches!(res, Err(FederationErr::DuplicateTask(name)) if name == "train"));
        assert_eq!(keeper.len(), 1);
    }

    #[test]
    fn kwargs_and_aggregation_are_attached() {
        let mut keeper = TaskKeeper::new();
        keeper.register("train", TaskKind::Train, noop).unwrap();
        keeper.add_kwargs("train", [("epochs", json!(2))]).unwrap();
        keeper
            .set_aggregation("train", AggregationSpec::Median)
            .unwrap();

        let spec = keeper.spec("train").unwrap();
        assert_eq!(spec.kwargs["epochs"], json!(2));
        assert_eq!(spec.aggregation, AggregationSpec::Median);

        assert!(matches!(
            keeper.add_kwargs("missing", [("a", json!(1))]),
            Err(FederationErr::UnknownTask(_))
        ));
    }

    #[test]
    fn closures_are_tasks() {
        let mut keeper = TaskKeeper::new();
        keeper
            .register("count", TaskKind::Validate, |ctx: TaskContext<'_>| -> Result<Metrics> {
                let mut metrics = Metrics::new();
                metrics.insert("params".into(), ctx.state.params().len() as f32);
                Ok(metrics)
            })
            .unwrap();

        assert!(keeper.get("count").is_some());
        assert!(keeper.get("other").is_none());
    }
}
