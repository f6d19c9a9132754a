//! Federated training of a small CNN on CIFAR-10.

pub mod cifar10;
pub mod config;
pub mod dataset;
pub mod net;
pub mod tasks;

pub use cifar10::Cifar10ShardDescriptor;
pub use config::TrainingConfig;
pub use dataset::Cifar10Data;
