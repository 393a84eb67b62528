//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Ember command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "ember", about = "Ember game transport server")]
pub struct CliArgs {
    /// Address to bind.
    #[arg(long)]
    pub address: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Transport profile (plain_text, http, websocket).
    #[arg(long)]
    pub profile: Option<String>,

    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl CliArgs {
    /// The config directory: `--config` if given, else `<config dir>/ember`.
    pub fn config_dir(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| dirs::config_dir().map(|dir| dir.join("ember")))
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref address) = args.address {
            self.network.bind_address = address.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(ref profile) = args.profile {
            self.network.profile = profile.clone();
        }
        if let Some(max) = args.max_connections {
            self.network.max_connections = max;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
