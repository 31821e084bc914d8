pub mod alerts;
pub mod collector;
pub mod notify;
pub mod window;
