//! Logging configuration and initialization
//!
//! - Daily rotating file logging or console logging
//! - Configurable log directories and file prefixes
//! - Environment variable configuration

use anyhow::{Context, Result};
use std::env;
use tracing::info;
use tracing_appender::rolling;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with configurable output destination.
///
/// ## Environment Variables
///
/// - `LOG_DESTINATION`: "console" or "file" (default: "console")
/// - `LOG_DIR`: directory for log files (default: "./logs"), file mode only
/// - `LOG_FILE_PREFIX`: prefix for log file names (default: "channels"), file mode only
/// - `RUST_LOG`: standard env filter, defaults to "info"
pub fn init_logging() -> Result<()> {
    let log_destination = env::var("LOG_DESTINATION").unwrap_or_else(|_| "console".to_string());

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_destination.as_str() {
        "file" => {
            let log_dir = env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
            let prefix = env::var("LOG_FILE_PREFIX").unwrap_or_else(|_| "channels".to_string());

            std::fs::create_dir_all(&log_dir)
                .with_context(|| format!("failed to create log directory {}", log_dir))?;

            let file_appender = rolling::daily(&log_dir, &prefix);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false),
                )
                .try_init()
                .context("failed to initialize file logging")?;

            info!("Logging to daily rotating files in {}", log_dir);
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .context("failed to initialize console logging")?;
        }
    }

    Ok(())
}

/// Initialize logging for tests. Safe to call from multiple tests; only the
/// first call installs the subscriber.
pub fn init_test_logging() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
