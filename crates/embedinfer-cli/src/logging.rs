use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use embedinfer_core::{LogFormat, LoggingOptions};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `--log`, which wins
/// over the configured levels.
pub fn init(options: &LoggingOptions, cli_filter: Option<&str>) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(env) if !env.is_empty() => EnvFilter::try_new(env),
        _ => EnvFilter::try_new(cli_filter.unwrap_or(options.filter_directive())),
    }
    .context("invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match (&options.log_file, options.format) {
        (Some(path), format) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let builder = builder.with_writer(Mutex::new(file)).with_ansi(false);
            match format {
                LogFormat::Default => builder.compact().try_init(),
                LogFormat::Iso8601 => builder.try_init(),
            }
        }
        (None, LogFormat::Default) => builder.compact().try_init(),
        (None, LogFormat::Iso8601) => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
