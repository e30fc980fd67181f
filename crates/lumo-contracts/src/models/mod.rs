mod candidates;
mod registry;

pub use candidates::{CandidatePlan, CandidatePlanner};
pub use registry::{ModelRegistry, ModelSpec};
