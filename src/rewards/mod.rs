pub mod model;
pub mod queue;
pub mod repository;
pub mod repository_sqlx;
pub mod worker;
