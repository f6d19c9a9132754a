pub mod experiment;
pub mod federation;
pub mod model;
