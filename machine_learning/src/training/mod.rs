mod builder;
mod state;
mod stats;

pub use builder::StateBuilder;
pub use state::TrainingState;
pub use stats::{EpochStats, EvalStats};
