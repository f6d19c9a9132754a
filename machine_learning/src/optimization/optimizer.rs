use crate::{MlErr, Result};

pub trait Optimizer {
    /// Takes one step over `params` following `grad`.
    ///
    /// # Returns
    /// An error if both slices differ in length.
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()>;

    /// Forgets any state accumulated across steps.
    fn reset(&mut self) {}
}

pub(super) fn check_len(params: &[f32], grad: &[f32]) -> Result<()> {
    if params.len() != grad.len() {
        return Err(MlErr::SizeMismatch {
            what: "gradient",
            got: grad.len(),
            expected: params.len(),
        });
    }

    Ok(())
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        (**self).update_params(params, grad)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}
