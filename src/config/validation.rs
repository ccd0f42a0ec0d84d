//! Configuration validation.

use crate::backend::parse_upstream;
use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - At least one backend
/// - Every backend is an `http` URL with a host
/// - No duplicate backends
/// - Metrics endpoint not bound to the proxy listen address
/// - Non-zero timeouts
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.backends.is_empty() {
        errors.push("at least one backend must be defined".to_string());
    }

    let mut seen = HashSet::new();
    for address in &config.backends {
        match parse_upstream(address) {
            Ok(url) => {
                if !seen.insert(url) {
                    errors.push(format!("duplicate backend: {}", address));
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    let metrics = &config.global.metrics;
    if metrics.enabled {
        if metrics.address == config.listen {
            errors.push(format!(
                "metrics address {} conflicts with listen address",
                metrics.address
            ));
        }
        if !metrics.path.starts_with('/') {
            errors.push(format!(
                "metrics path '{}' must start with '/'",
                metrics.path
            ));
        }
    }

    if config.proxy.connect_timeout.is_zero() {
        errors.push("proxy connect_timeout must be greater than zero".to_string());
    }
    if config.proxy.queue_timeout.is_zero() {
        errors.push("proxy queue_timeout must be greater than zero".to_string());
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
