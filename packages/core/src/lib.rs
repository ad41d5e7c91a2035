// Library root: exposes internal modules for integration tests in `tests/`.
// Production entry point remains `src/main.rs`.

pub mod alerts;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod forecast;
pub mod health;
pub mod metrics;
pub mod scheduler;
pub mod store;
pub mod types;

// Only needed by the binary, declared pub so tests can reach them.
pub mod cli;
pub mod logging;
