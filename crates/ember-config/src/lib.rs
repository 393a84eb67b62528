//! Configuration for Ember.
//!
//! Settings persist to disk as RON files. Supports CLI overrides via clap,
//! hot-reload detection, and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig};
pub use error::ConfigError;
