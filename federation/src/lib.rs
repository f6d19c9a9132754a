mod aggregation;
pub mod aggregator;
pub mod client;
mod collaborator;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
mod experiment;
mod federation;
pub mod link;
pub mod model;
pub mod report;
pub mod shard;
mod simulation;
pub mod tasks;

pub use aggregation::{LocalUpdate, aggregate};
pub use client::AggregatorClient;
pub use collaborator::Collaborator;
pub use config::FederationConfig;
pub use data::DataInterface;
pub use device::{Device, DeviceConfig};
pub use error::{FederationErr, Result};
pub use experiment::{ExperimentParams, FlExperiment};
pub use federation::{DIRECTOR_ID, Federation};
pub use model::ModelInterface;
pub use report::ExperimentReport;
pub use shard::{DatasetKind, DummyShardDescriptor, ShardDescriptor};
pub use tasks::{Task, TaskContext, TaskKeeper};
