//! Database layer: connection pooling, row models, repositories

pub mod connection;
pub mod models;
pub mod repositories;

pub use connection::{DatabaseConnection, DatabasePool};
