//! Telemetry configuration from environment variables.

use std::env;

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name logged at startup
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error, or directives)
    pub log_level: String,

    /// Whether to write logs to the console at all
    pub console_output: bool,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "process-bus".to_string(),
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `BUS_SERVICE_NAME`: Service name (default: process-bus)
    /// - `BUS_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `BUS_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `BUS_JSON_LOGS`: Enable JSON logs (default: false)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            service_name: lookup("BUS_SERVICE_NAME").unwrap_or(defaults.service_name),

            log_level: lookup("BUS_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),

            console_output: lookup("BUS_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(defaults.console_output),

            json_logs: lookup("BUS_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.json_logs),
        }
    }

    /// Named configuration, other settings from the environment.
    #[must_use]
    pub fn for_service(name: &str) -> Self {
        Self {
            service_name: name.to_string(),
            ..Self::from_env()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(config, TelemetryConfig::default());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_env_overrides() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("BUS_SERVICE_NAME", "prices"),
            ("RUST_LOG", "debug"),
            ("BUS_JSON_LOGS", "1"),
            ("BUS_CONSOLE_OUTPUT", "FALSE"),
        ]));
        assert_eq!(config.service_name, "prices");
        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
        assert!(!config.console_output);
    }

    #[test]
    fn test_bus_log_level_wins() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("BUS_LOG_LEVEL", "bus_transport=trace"),
            ("RUST_LOG", "warn"),
        ]));
        assert_eq!(config.log_level, "bus_transport=trace");
    }
}
