//! Logging setup

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Build the filter: `RUST_LOG` when set, else `default_level`
pub fn log_filter(default_level: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))
}

/// Install the global tracing subscriber, writing to stderr
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = log_filter(default_level)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_accepts_directives() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(log_filter("debug").is_ok());
            assert!(log_filter("usbtarget=trace,info").is_ok());
        }
    }
}
