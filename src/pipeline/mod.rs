pub mod engine;
pub mod reward;

pub use engine::{DecisionPipeline, Explanation, Factor, ProcessResult};
