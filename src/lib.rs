pub mod canvas;
pub mod config;
pub mod diagnostics;
pub mod gfx;
pub mod metadata;
pub mod namespace;
pub mod outcome;
pub mod run_context;
pub mod script_log;

// Script execution
pub mod clock;
pub mod engine;
pub mod host;

// Export pipeline
pub mod delegate;
pub mod export;
pub mod scheduler;

pub mod cli;
pub mod job;

pub use engine::ExecutionEngine;
pub use host::ScriptHost;
pub use outcome::{Outcome, Output};
