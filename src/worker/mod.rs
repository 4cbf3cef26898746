//! Per-workspace workers and the registry that supervises them.

pub mod registry;
pub mod worker;

pub use registry::WorkerRegistry;
pub use worker::{WorkerCommand, WorkerDeps};
