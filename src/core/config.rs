/// Runtime Configuration
///
/// The server is configured entirely through environment variables. Values
/// that are unset fall back to defaults; values that are set but cannot be
/// parsed abort startup instead of being silently replaced.

use std::str::FromStr;
use std::time::Duration;

use actix_web::http::Uri;

use crate::core::error::RelayError;

/// Origins accepted by the CORS middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowedOrigins {
    /// `*`: any origin, answered with a wildcard header.
    Any,
    /// Exact `scheme://host[:port]` origins.
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub origins: AllowedOrigins,
    pub allow_credentials: bool,
    pub max_age_secs: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name reported by `/health` and in the `connect` frame
    pub server_name: String,
    pub server_version: String,
    pub host: String,
    pub port: u16,
    /// Actix worker threads
    pub workers: usize,
    /// Interval between server pings on WebSocket sessions
    pub heartbeat_interval: Duration,
    /// Sessions silent for longer than this are closed
    pub client_timeout: Duration,
    /// Largest inbound WebSocket frame, in bytes
    pub max_frame_size: usize,
    pub cors: CorsConfig,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_name: "realtime-server".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            host: "0.0.0.0".to_string(),
            port: 3000,
            workers: default_workers(),
            heartbeat_interval: Duration::from_secs(5),
            client_timeout: Duration::from_secs(10),
            max_frame_size: 64 * 1024,
            cors: CorsConfig {
                origins: AllowedOrigins::Any,
                allow_credentials: false,
                max_age_secs: 3600,
            },
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, RelayError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// `from_env` delegates here; tests pass a map-backed closure instead of
    /// mutating the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, RelayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let heartbeat_secs: u64 = parse_var(&lookup, "HEARTBEAT_INTERVAL_SECS", 5)?;
        let timeout_secs: u64 = parse_var(&lookup, "CLIENT_TIMEOUT_SECS", 10)?;
        if heartbeat_secs == 0 {
            return Err(RelayError::Config(
                "HEARTBEAT_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if timeout_secs <= heartbeat_secs {
            return Err(RelayError::Config(format!(
                "CLIENT_TIMEOUT_SECS ({timeout_secs}) must exceed HEARTBEAT_INTERVAL_SECS ({heartbeat_secs})"
            )));
        }

        let max_frame_size: usize = parse_var(&lookup, "MAX_FRAME_SIZE", defaults.max_frame_size)?;
        if max_frame_size == 0 {
            return Err(RelayError::Config(
                "MAX_FRAME_SIZE must be greater than zero".to_string(),
            ));
        }

        let workers: usize = parse_var(&lookup, "WORKER_THREADS", defaults.workers)?;
        if workers == 0 {
            return Err(RelayError::Config(
                "WORKER_THREADS must be greater than zero".to_string(),
            ));
        }

        let origins = match lookup("CORS_ALLOWED_ORIGINS") {
            Some(raw) => parse_origins(&raw)?,
            None => AllowedOrigins::Any,
        };
        let allow_credentials = parse_bool(&lookup, "CORS_ALLOW_CREDENTIALS", false)?;
        // Browsers refuse credentialed responses carrying a wildcard origin.
        if allow_credentials && origins == AllowedOrigins::Any {
            return Err(RelayError::Config(
                "CORS_ALLOW_CREDENTIALS requires an explicit CORS_ALLOWED_ORIGINS list".to_string(),
            ));
        }

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(RelayError::Config(format!(
                    "LOG_FORMAT must be 'text' or 'json', got '{other}'"
                )));
            }
        };

        Ok(Self {
            server_name: lookup("SERVER_NAME").unwrap_or(defaults.server_name),
            server_version: lookup("SERVER_VERSION").unwrap_or(defaults.server_version),
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "PORT", defaults.port)?,
            workers,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            client_timeout: Duration::from_secs(timeout_secs),
            max_frame_size,
            cors: CorsConfig {
                origins,
                allow_credentials,
                max_age_secs: parse_var(&lookup, "CORS_MAX_AGE_SECS", defaults.cors.max_age_secs)?,
            },
            log_format,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// CPU count, capped at 16 to avoid excessive context switching.
fn default_workers() -> usize {
    num_cpus::get().clamp(1, 16)
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, RelayError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| RelayError::Config(format!("{key} has an invalid value '{raw}'"))),
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> Result<bool, RelayError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(v) => Err(RelayError::Config(format!(
            "{key} must be a boolean, got '{v}'"
        ))),
    }
}

/// Parse `*` or a comma-separated list of origins.
pub fn parse_origins(raw: &str) -> Result<AllowedOrigins, RelayError> {
    let raw = raw.trim();
    if raw == "*" {
        return Ok(AllowedOrigins::Any);
    }

    let origins = raw
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(|o| validate_origin(o).map(|_| o.to_string()))
        .collect::<Result<Vec<_>, _>>()?;

    if origins.is_empty() {
        return Err(RelayError::Config(
            "CORS_ALLOWED_ORIGINS must be '*' or a list of origins".to_string(),
        ));
    }
    Ok(AllowedOrigins::List(origins))
}

/// Origins are compared byte-for-byte, so anything beyond
/// `scheme://host[:port]` could never match a browser's `Origin` header.
fn validate_origin(origin: &str) -> Result<(), RelayError> {
    let invalid = || RelayError::Config(format!("invalid CORS origin '{origin}'"));

    if origin.ends_with('/') {
        return Err(invalid());
    }
    let uri: Uri = origin.parse().map_err(|_| invalid())?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(invalid()),
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    let bare = uri
        .path_and_query()
        .is_none_or(|pq| pq.as_str().is_empty() || pq.as_str() == "/");
    if !bare {
        return Err(invalid());
    }
    Ok(())
}
