//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Compact human-readable lines.
    Text,
    /// One JSON object per line, for log aggregation.
    Json,
}

/// auth-gateway — token validation and identity sync for the platform.
#[derive(Debug, Parser)]
#[command(name = "auth-gateway", version, about)]
pub struct Cli {
    /// Path to a YAML configuration file. Environment variables prefixed
    /// with AUTH_GATEWAY_ override file values.
    #[arg(short, long, env = "AUTH_GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_without_arguments() {
        let cli = Cli::parse_from(["auth-gateway"]);
        assert!(cli.config.is_none());
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_format, LogFormat::Text);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "auth-gateway",
            "--config",
            "/etc/auth-gateway.yaml",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ]);
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/etc/auth-gateway.yaml"))
        );
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
