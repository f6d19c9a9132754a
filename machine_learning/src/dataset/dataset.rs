use std::ops::Range;

use ndarray::{Array2, ArrayD, IxDyn};

use crate::{MlErr, Result};

/// Samples and targets held in memory as two flat buffers.
///
/// Every sample has `sample_shape` and every target is a row of `target_size` values,
/// one hot encoded for classification.
#[derive(Debug, Clone)]
pub struct Dataset {
    samples: Vec<f32>,
    targets: Vec<f32>,
    sample_shape: Vec<usize>,
    target_size: usize,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Returns
    /// An error if the buffers do not hold the same amount of whole samples and targets.
    pub fn new(
        samples: Vec<f32>,
        targets: Vec<f32>,
        sample_shape: Vec<usize>,
        target_size: usize,
    ) -> Result<Self> {
        let sample_size: usize = sample_shape.iter().product();

        if sample_size == 0 || target_size == 0 {
            return Err(MlErr::ShapeMismatch {
                what: "dataset sample and target",
                got: [sample_shape.as_slice(), &[target_size]].concat(),
                expected: Vec::new(),
            });
        }

        let len = samples.len() / sample_size;

        if samples.len() % sample_size != 0 || targets.len() != len * target_size {
            return Err(MlErr::SizeMismatch {
                what: "dataset targets",
                got: targets.len(),
                expected: len * target_size,
            });
        }

        Ok(Self {
            samples,
            targets,
            sample_shape,
            target_size,
        })
    }

    /// Creates a classification `Dataset`, one hot encoding `labels` over `classes`.
    ///
    /// # Returns
    /// An error if a label is not below `classes` or the sizes do not line up.
    pub fn classification(
        samples: Vec<f32>,
        labels: &[u8],
        sample_shape: Vec<usize>,
        classes: usize,
    ) -> Result<Self> {
        if classes == 0 {
            return Self::new(samples, Vec::new(), sample_shape, classes);
        }

        let mut targets = vec![0.; labels.len() * classes];

        for (row, &label) in targets.chunks_mut(classes).zip(labels) {
            let Some(slot) = row.get_mut(label as usize) else {
                return Err(MlErr::SizeMismatch {
                    what: "class label",
                    got: label as usize,
                    expected: classes,
                });
            };

            *slot = 1.;
        }

        Self::new(samples, targets, sample_shape, classes)
    }

    pub fn len(&self) -> usize {
        self.targets.len() / self.target_size
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    pub fn sample_size(&self) -> usize {
        self.sample_shape.iter().product()
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    /// Copies the samples in `range` into a new dataset.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let sample_size = self.sample_size();
        let end = range.end.min(self.len());
        let start = range.start.min(end);

        let samples = start * sample_size..end * sample_size;
        let targets = start * self.target_size..end * self.target_size;

        Self {
            samples: self.samples[samples].to_vec(),
            targets: self.targets[targets].to_vec(),
            sample_shape: self.sample_shape.clone(),
            target_size: self.target_size,
        }
    }

    /// Gathers the samples at `indices` into a `(batch, sample_shape..)` input and a
    /// `(batch, target_size)` target.
    pub fn gather(&self, indices: &[usize]) -> Result<(ArrayD<f32>, Array2<f32>)> {
        let sample_size = self.sample_size();
        let mut x = Vec::with_capacity(indices.len() * sample_size);
        let mut y = Vec::with_capacity(indices.len() * self.target_size);

        for &i in indices {
            x.extend_from_slice(&self.samples[i * sample_size..(i + 1) * sample_size]);
            y.extend_from_slice(&self.targets[i * self.target_size..(i + 1) * self.target_size]);
        }

        let mut shape = Vec::with_capacity(self.sample_shape.len() + 1);
        shape.push(indices.len());
        shape.extend(&self.sample_shape);

        let x = ArrayD::from_shape_vec(IxDyn(&shape), x)?;
        let y = Array2::from_shape_vec((indices.len(), self.target_size), y)?;
        Ok((x, y))
    }
}
