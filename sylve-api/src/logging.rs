///! Logging configuration module
///! Provides structured logging configuration

use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,             // log level (trace, debug, info, warn, error)
    pub json_format: bool,         // use JSON formatting
    pub file_path: Option<String>, // log file path
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            file_path: Some("/var/log/sylve".to_string()),
        }
    }
}

impl LoggingConfig {
    /// Initialize logging based on configuration
    pub fn init(&self) -> Result<(), Box<dyn std::error::Error>> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.clone()));

        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .with_thread_ids(false)
            .with_ansi(!self.json_format)
            .try_init();

        tracing::info!("Logging initialized - level: {}", self.level);

        Ok(())
    }

    /// Initialize with environment variables
    pub fn init_from_env() -> Result<(), Box<dyn std::error::Error>> {
        let level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let file_path = std::env::var("SYLVE_LOG_PATH").ok();

        Self {
            level,
            file_path,
            ..Default::default()
        }
        .init()
    }
}
