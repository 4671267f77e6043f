pub mod app;
pub mod cache;
pub mod config;
pub mod ingest;
pub mod orchestrator;
pub mod output;
pub mod providers;
pub mod services;
pub mod store;
