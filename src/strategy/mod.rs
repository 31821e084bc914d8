pub mod bandit;
pub mod cache;
pub mod model;
pub mod phase;
pub mod selector;
