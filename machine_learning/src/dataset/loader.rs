use std::{num::NonZeroUsize, sync::Arc};

use ndarray::{Array2, ArrayD};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

use super::Dataset;
use crate::Result;

/// Iterates a shared dataset in batches, optionally reshuffling on every pass.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<Dataset>,
    batch_size: NonZeroUsize,
    order: Vec<usize>,
    rng: Option<StdRng>,
}

impl DataLoader {
    /// Creates a new `DataLoader` that visits samples in order.
    pub fn new(dataset: Arc<Dataset>, batch_size: NonZeroUsize) -> Self {
        let order = (0..dataset.len()).collect();

        Self {
            dataset,
            batch_size,
            order,
            rng: None,
        }
    }

    /// Makes every pass visit the samples in a new random order derived from `seed`.
    pub fn shuffled(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    pub fn batch_size(&self) -> NonZeroUsize {
        self.batch_size
    }

    /// Starts a new pass over the dataset.
    pub fn batches(&mut self) -> impl Iterator<Item = Result<(ArrayD<f32>, Array2<f32>)>> + '_ {
        if let Some(rng) = &mut self.rng {
            self.order.shuffle(rng);
        }

        let dataset = &self.dataset;
        self.order
            .chunks(self.batch_size.get())
            .map(move |indices| dataset.gather(indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(len: usize, batch: usize) -> DataLoader {
        let samples = (0..len).map(|v| v as f32).collect();
        let dataset = Dataset::new(samples, vec![0.; len], vec![1], 1).unwrap();
        DataLoader::new(Arc::new(dataset), NonZeroUsize::new(batch).unwrap())
    }

    fn pass(loader: &mut DataLoader) -> Vec<Vec<f32>> {
        loader
            .batches()
            .map(|b| b.unwrap().0.iter().copied().collect())
            .collect()
    }

    #[test]
    fn last_batch_is_partial() {
        let mut loader = loader(5, 2);
        assert_eq!(pass(&mut loader), [vec![0., 1.], vec![2., 3.], vec![4.]]);
    }

    #[test]
    fn shuffling_is_seeded_and_complete() {
        let mut a = loader(20, 4).shuffled(9);
        let mut b = loader(20, 4).shuffled(9);

        let first = pass(&mut a);
        assert_eq!(first, pass(&mut b));

        let mut seen: Vec<f32> = first.concat();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, (0..20).map(|v| v as f32).collect::<Vec<_>>());

        assert_ne!(first, pass(&mut a));
    }
}
