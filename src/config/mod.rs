// src/config/mod.rs

//! Configuration loading and validation for batchdag.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate it and turn it into Task Definitions (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_str};
pub use model::{
    parse_duration, CheckConfig, ConfigFile, ConnectionConfig, DagSection, OperatorConfig,
    RawConfigFile, SchedulerSection, TaskConfig,
};
