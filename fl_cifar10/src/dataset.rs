use std::{num::NonZeroUsize, sync::Arc};

use federation::{DataInterface, DatasetKind, FederationErr, Result, ShardDescriptor};
use machine_learning::dataset::{DataLoader, Dataset};

/// Serves the splits of a CIFAR-10 shard to the experiment's tasks.
#[derive(Debug, Clone)]
pub struct Cifar10Data {
    train_batch_size: NonZeroUsize,
    valid_batch_size: NonZeroUsize,
    train: Option<Arc<Dataset>>,
    valid: Option<Arc<Dataset>>,
}

impl Cifar10Data {
    /// Creates a new `Cifar10Data`, unbound until `set_shard_descriptor` is called.
    ///
    /// # Returns
    /// An error if a batch size is 0.
    pub fn new(train_batch_size: usize, valid_batch_size: usize) -> Result<Self> {
        let batch_size = |size: usize, what: &str| {
            let err = || FederationErr::Config(format!("the {what} batch size must not be 0"));
            NonZeroUsize::new(size).ok_or_else(err)
        };

        Ok(Self {
            train_batch_size: batch_size(train_batch_size, "train")?,
            valid_batch_size: batch_size(valid_batch_size, "validation")?,
            train: None,
            valid: None,
        })
    }
}

impl DataInterface for Cifar10Data {
    fn set_shard_descriptor(&mut self, shard: Arc<dyn ShardDescriptor>) -> Result<()> {
        self.train = Some(Arc::new(shard.get_dataset(DatasetKind::Train)?));
        self.valid = Some(Arc::new(shard.get_dataset(DatasetKind::Valid)?));
        Ok(())
    }

    fn train_loader(&self, seed: u64) -> Result<DataLoader> {
        let train = self
            .train
            .clone()
            .ok_or(FederationErr::MissingShardDescriptor)?;

        Ok(DataLoader::new(train, self.train_batch_size).shuffled(seed))
    }

    fn valid_loader(&self) -> Result<DataLoader> {
        let valid = self
            .valid
            .clone()
            .ok_or(FederationErr::MissingShardDescriptor)?;

        Ok(DataLoader::new(valid, self.valid_batch_size))
    }

    fn train_data_size(&self) -> usize {
        self.train.as_ref().map_or(0, |d| d.len())
    }

    fn valid_data_size(&self) -> usize {
        self.valid.as_ref().map_or(0, |d| d.len())
    }
}

#[cfg(test)]
mod tests {
    use federation::DummyShardDescriptor;

    use super::*;

    #[test]
    fn loaders_need_a_shard() {
        let data = Cifar10Data::new(4, 8).unwrap();

        assert!(matches!(
            data.train_loader(0),
            Err(FederationErr::MissingShardDescriptor)
        ));
        assert!(matches!(
            data.valid_loader(),
            Err(FederationErr::MissingShardDescriptor)
        ));
        assert_eq!(data.train_data_size(), 0);
    }

    #[test]
    fn loaders_use_their_batch_sizes() {
        let mut data = Cifar10Data::new(4, 8).unwrap();
        let shard = DummyShardDescriptor::new(vec![3, 32, 32], vec![10], 10);
        data.set_shard_descriptor(Arc::new(shard)).unwrap();

        assert_eq!(data.train_data_size(), 10);
        assert_eq!(data.valid_data_size(), 10);
        assert_eq!(data.train_loader(1).unwrap().batch_size().get(), 4);
        assert_eq!(data.valid_loader().unwrap().batch_size().get(), 8);
    }

    #[test]
    fn zero_batch_sizes_are_rejected() {
        assert!(Cifar10Data::new(0, 8).is_err());
        assert!(Cifar10Data::new(8, 0).is_err());
    }
}
