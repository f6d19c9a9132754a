use super::{Optimizer, optimizer::check_len};
use crate::Result;

/// Gradient descent accumulating a velocity across steps.
#[derive(Debug, Clone)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - The fraction of the previous velocity kept on every step.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, params: &mut [f32], grad: &[f32]) -> Result<()> {
        check_len(params, grad)?;
        check_len(params, &self.velocity)?;

        let lr = self.learning_rate;
        let mu = self.momentum;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = mu * *v + g;
                *p -= lr * *v;
            });

        Ok(())
    }

    fn reset(&mut self) {
        self.velocity.fill(0.);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn velocity_builds_up_and_resets() {
        let mut optimizer = GradientDescentWithMomentum::new(1, 0.1, 0.9);
        let mut params = [1.];

        optimizer.update_params(&mut params, &[1.]).unwrap();
        assert!((params[0] - 0.9).abs() < 1e-6);

        optimizer.update_params(&mut params, &[1.]).unwrap();
        assert!((params[0] - (0.9 - 0.19)).abs() < 1e-6);

        optimizer.reset();
        optimizer.update_params(&mut params, &[1.]).unwrap();
        assert!((params[0] - (0.71 - 0.1)).abs() < 1e-6);
    }

    #[test]
    fn mismatched_gradient_is_rejected() {
        let mut optimizer = GradientDescentWithMomentum::new(2, 0.1, 0.9);
        assert!(optimizer.update_params(&mut [0., 0.], &[1.]).is_err());
    }
}
