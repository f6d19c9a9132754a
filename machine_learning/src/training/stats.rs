/// Summary of one training pass over a loader.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochStats {
    /// Mean loss per sample.
    pub loss: f32,
    pub samples: usize,
    pub batches: usize,
}

/// Summary of one evaluation pass over a loader.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalStats {
    /// Mean loss per sample.
    pub loss: f32,
    /// Fraction of samples whose highest scoring output matches the target's.
    pub accuracy: f32,
    pub samples: usize,
}
