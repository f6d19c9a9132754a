use std::sync::Arc;

use machine_learning::dataset::DataLoader;

use crate::{Result, shard::ShardDescriptor};

/// Turns the datasets of a shard descriptor into the loaders tasks iterate over.
///
/// Collaborators each own a clone, so implementors meant for experiments should also be
/// `Clone + Send + 'static`.
pub trait DataInterface: Send + Sync {
    /// Binds the interface to the local shard, loading its splits.
    fn set_shard_descriptor(&mut self, shard: Arc<dyn ShardDescriptor>) -> Result<()>;

    /// A loader over the train split, reshuffled on every pass with `seed`.
    fn train_loader(&self, seed: u64) -> Result<DataLoader>;

    /// A loader over the validation split.
    fn valid_loader(&self) -> Result<DataLoader>;

    fn train_data_size(&self) -> usize;

    fn valid_data_size(&self) -> usize;
}
