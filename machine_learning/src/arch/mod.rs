pub mod activations;
mod builder;
pub mod layers;
pub mod loss;
mod sequential;

pub use builder::ModelBuilder;
pub use sequential::Sequential;
