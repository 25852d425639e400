pub mod inference;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod sqlite;
