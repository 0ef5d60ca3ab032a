/// Logging Setup
///
/// All output goes to stderr through `tracing`. `RUST_LOG` selects the
/// filter (default `info`); `LOG_FORMAT` picks human-readable or JSON lines.
/// Actix's access logger writes through the `log` facade, which the
/// subscriber bridges into the same output.

use tracing_subscriber::EnvFilter;

use crate::core::config::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("logging already initialized: {e}");
    }
}
