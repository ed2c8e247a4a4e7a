use anyhow::Context;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        match s {
            "plain" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Unrecognized log format: {s}. Expected one of: plain, json"),
        }
    }
}

/// Initialize the process-wide tracing subscriber. Filtering defaults to
/// `info` and is overridable via `RUST_LOG`. Fails if a subscriber is
/// already installed; in-process embeddings may ignore that error.
pub fn init(log_format: LogFormat) -> anyhow::Result<()> {
    let default_filter_str = "info";

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter_str));

    let base_logger = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Json => base_logger.json().try_init(),
        LogFormat::Plain => base_logger.try_init(),
    }
    .map_err(|e| anyhow::anyhow!(e))
    .context("failed to initialize tracing subscriber")
}
