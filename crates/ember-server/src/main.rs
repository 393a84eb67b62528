//! Standalone Ember server.
//!
//! Loads `config.ron`, applies CLI overrides, and serves the configured
//! transport profile with an echo handler until Ctrl-C.
//!
//! Run with: `cargo run -p ember-server -- --profile websocket --port 7777`

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ember_config::{CliArgs, Config};
use ember_net::{
    GameServer, MessageHandler, PipelineLimits, ServerConfig, Session, SocketConfig,
    TransportProfile,
};
use tracing::{error, info, warn};

/// How long Ctrl-C waits for open connections to tear down.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Logs every message and sends it back to its session.
struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn process_message(&self, session: &mut Session, message: &str) {
        info!(
            "Connection {} ({}) sent {} bytes",
            session.id(),
            session.identity(),
            message.len()
        );
        session.send_message(message);
    }

    fn session_closed(&self, session: &Session) {
        info!("Session {} ({}) ended", session.id(), session.identity());
    }
}

/// Translate the loaded config into server settings. Unknown profiles fail here.
fn server_config(config: &Config) -> Result<ServerConfig, Box<dyn Error>> {
    let network = &config.network;
    Ok(ServerConfig {
        bind_addr: network.socket_addr()?,
        max_connections: network.max_connections,
        profile: network.profile.parse::<TransportProfile>()?,
        limits: PipelineLimits {
            max_pending_frame_size: network.max_pending_frame_bytes,
            max_http_body_size: network.max_http_body_bytes,
            outbound_queue_capacity: network.outbound_queue_capacity,
            ..PipelineLimits::default()
        },
        socket: SocketConfig::default(),
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config_dir = args.config_dir();

    let mut config = match &config_dir {
        Some(dir) => Config::load_or_create(dir).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}, using defaults");
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
    ember_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    let settings = match server_config(&config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = GameServer::new(settings, Arc::new(EchoHandler));
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Server failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let run = server.run_with_listener(listener);
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Shutting down");
            server.shutdown();
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Connections still open after {DRAIN_TIMEOUT:?}, exiting anyway");
                    Ok(())
                }
            }
        }
    };

    if let Err(e) = result {
        error!("Server stopped: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
