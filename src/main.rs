/// Realtime Server Entry Point
///
/// Loads configuration from environment variables, sets up logging and runs
/// the HTTP + WebSocket server until shutdown.
///
/// Environment Variables:
/// - SERVER_NAME: Name of the server (default: "realtime-server")
/// - SERVER_VERSION: Version string (default: crate version)
/// - HOST: Bind address (default: "0.0.0.0")
/// - PORT: Port number (default: 3000)
/// - WORKER_THREADS: Actix workers (default: CPU count, max 16)
/// - HEARTBEAT_INTERVAL_SECS / CLIENT_TIMEOUT_SECS: WebSocket liveness (default: 5 / 10)
/// - MAX_FRAME_SIZE: Largest inbound WebSocket frame in bytes (default: 65536)
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins (default: "*")
/// - CORS_ALLOW_CREDENTIALS: "true" or "false" (default: "false")
/// - CORS_MAX_AGE_SECS: Preflight cache lifetime (default: 3600)
/// - LOG_FORMAT: "text" or "json" (default: "text"); RUST_LOG sets the filter

mod core;
mod events;

use crate::core::config::Config;
use crate::core::{logging, server};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    logging::init(config.log_format);
    server::run_server_http(config).await
}
