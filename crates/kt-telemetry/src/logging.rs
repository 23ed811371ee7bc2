use std::fs::OpenOptions;
use std::sync::Mutex;

use kt_core::config::{ConfigError, LogFormat, LoggingConfig};
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot open log output '{path}': {source}")]
    Output {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn make_writer(output: &str) -> Result<BoxMakeWriter, LoggingError> {
    match output {
        "" | "-" | "/dev/stdout" | "stdout" => Ok(BoxMakeWriter::new(std::io::stdout)),
        "/dev/stderr" | "stderr" => Ok(BoxMakeWriter::new(std::io::stderr)),
        path => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::Output {
                    path: path.to_string(),
                    source,
                })?;
            Ok(BoxMakeWriter::new(Mutex::new(file)))
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` overrides the configured level when set. Returns `Ok(false)`
/// if a subscriber was already installed (e.g. by an earlier test), in which
/// case nothing changes.
pub fn init_logging(service_name: &str, config: &LoggingConfig) -> Result<bool, LoggingError> {
    let level = config.filter_directive()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = make_writer(&config.output)?;

    let installed = match config.format {
        LogFormat::Text => fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .with_level(true)
            .try_init()
            .is_ok(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(
            service = service_name,
            format = ?config.format,
            output = %config.output,
            "logging initialised"
        );
    }
    Ok(installed)
}
