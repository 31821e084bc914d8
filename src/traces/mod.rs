pub mod model;
pub mod recorder;
pub mod repository;
pub mod repository_sqlx;
