use comms::specs::federation::ShardInfo;
use machine_learning::dataset::Dataset;

use crate::Result;

/// The split of a shard to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    Train,
    Valid,
}

/// Gives access to the local data of a single participant.
pub trait ShardDescriptor: Send + Sync {
    /// Loads one split of the shard.
    fn get_dataset(&self, kind: DatasetKind) -> Result<Dataset>;

    /// The shape of a single sample.
    fn sample_shape(&self) -> Vec<usize>;

    /// The shape of a single target.
    fn target_shape(&self) -> Vec<usize>;

    fn description(&self) -> String;

    /// The shard as advertised in the registry.
    fn shard_info(&self) -> ShardInfo {
        ShardInfo {
            description: self.description(),
            sample_shape: self.sample_shape(),
            target_shape: self.target_shape(),
        }
    }
}

/// A shard of zeroed samples labelled with the first class, used to smoke test tasks
/// without real data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DummyShardDescriptor {
    sample_shape: Vec<usize>,
    target_shape: Vec<usize>,
    size: usize,
}

impl DummyShardDescriptor {
    /// Creates a new `DummyShardDescriptor`.
    ///
    /// # Arguments
    /// * `sample_shape` - The shape of every sample.
    /// * `target_shape` - The shape of every target.
    /// * `size` - The amount of samples in each split.
    pub fn new(sample_shape: Vec<usize>, target_shape: Vec<usize>, size: usize) -> Self {
        Self {
            sample_shape,
            target_shape,
            size,
        }
    }

    pub fn from_info(info: &ShardInfo, size: usize) -> Self {
        Self::new(info.sample_shape.clone(), info.target_shape.clone(), size)
    }
}

impl ShardDescriptor for DummyShardDescriptor {
    fn get_dataset(&self, _kind: DatasetKind) -> Result<Dataset> {
        let sample_size: usize = self.sample_shape.iter().product();
        let target_size: usize = self.target_shape.iter().product();

        let mut targets = vec![0.; self.size * target_size];
        for t in targets.iter_mut().step_by(target_size.max(1)) {
            *t = 1.;
        }

        let dataset = Dataset::new(
            vec![0.; self.size * sample_size],
            targets,
            self.sample_shape.clone(),
            target_size,
        )?;

        Ok(dataset)
    }

    fn sample_shape(&self) -> Vec<usize> {
        self.sample_shape.clone()
    }

    fn target_shape(&self) -> Vec<usize> {
        self.target_shape.clone()
    }

    fn description(&self) -> String {
        format!("dummy shard of {} samples", self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_shard_has_requested_shapes() {
        let shard = DummyShardDescriptor::new(vec![3, 4, 4], vec![10], 5);
        let dataset = shard.get_dataset(DatasetKind::Valid).unwrap();

        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.sample_shape(), [3, 4, 4]);
        assert_eq!(dataset.target_size(), 10);

        let (x, y) = dataset.gather(&[0, 4]).unwrap();
        assert!(x.iter().all(|v| *v == 0.));
        assert_eq!(y.sum(), 2.);
        assert_eq!(y[[1, 0]], 1.);
    }

    #[test]
    fn shard_info_mirrors_descriptor() {
        let shard = DummyShardDescriptor::new(vec![2], vec![3], 1);
        let info = shard.shard_info();

        assert_eq!(info.sample_shape, [2]);
        assert_eq!(info.target_shape, [3]);
        assert_eq!(DummyShardDescriptor::from_info(&info, 1), shard);
    }
}
