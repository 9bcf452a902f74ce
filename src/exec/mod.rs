// src/exec/mod.rs

//! Operator execution layer.
//!
//! This module is responsible for actually running the operators of
//! scheduled Task Instances and reporting back to the Run's runtime via
//! `RunEvent`s.
//!
//! - [`worker`] owns the bounded worker pool; operators run on blocking
//!   threads so they never stall the dispatch loop.
//! - [`backend`] provides the `ExecutorBackend` trait and the concrete
//!   `OperatorExecutor` the runtime uses in production, and which tests can
//!   replace with a fake implementation.

pub mod backend;
pub mod worker;

pub use backend::{ExecutorBackend, OperatorExecutor};
pub use worker::WorkerPool;
