pub mod audit;
pub mod batch;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod models;
pub mod registry;
pub mod sources;
pub mod ssh;
pub mod templates;
pub mod token;
pub mod workflow;
