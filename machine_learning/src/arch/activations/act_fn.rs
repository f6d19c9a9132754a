use super::{Relu, Sigmoid};

/// An element-wise activation applied after a layer's affine transformation.
#[derive(Debug, Clone, Copy)]
pub enum ActFn {
    Relu(Relu),
    Sigmoid(Sigmoid),
}

impl ActFn {
    pub fn relu() -> Self {
        Self::Relu(Relu)
    }

    pub fn sigmoid(amp: f32) -> Self {
        Self::Sigmoid(Sigmoid::new(amp))
    }

    /// Evaluates the activation at `z`.
    pub fn f(&self, z: f32) -> f32 {
        match self {
            Self::Relu(a) => a.f(z),
            Self::Sigmoid(a) => a.f(z),
        }
    }

    /// Evaluates the derivative of the activation at `z`.
    pub fn df(&self, z: f32) -> f32 {
        match self {
            Self::Relu(a) => a.df(z),
            Self::Sigmoid(a) => a.df(z),
        }
    }
}
