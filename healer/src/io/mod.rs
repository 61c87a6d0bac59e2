//! Side effects: child processes, the sandbox, model backends, prompts,
//! configuration, task files and audit logs.

pub mod config;
pub mod harness;
pub mod iteration_log;
pub mod model;
pub mod process;
pub mod prompt;
pub mod sandbox;
pub mod task;
