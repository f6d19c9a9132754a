mod dataset;
mod loader;
mod shard;

pub use dataset::Dataset;
pub use loader::DataLoader;
pub use shard::shard_range;
