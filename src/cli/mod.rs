//! CLI module
//!
//! Command-line interface for the swarm engine.

pub mod args;
pub mod config;

pub use args::CliArgs;
pub use config::{Config, Target};
