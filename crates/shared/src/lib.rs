#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subsync shared infrastructure
//!
//! Configuration, database pool construction and tracing setup used by the
//! billing library and the worker binary.

pub mod config;
pub mod db;
pub mod telemetry;

pub use config::{parse_alt_products, Config, ConfigError, LedgerConfig, LogFormat, WorkerConfig};
pub use db::{create_pool, run_migrations};
pub use telemetry::init_tracing;
