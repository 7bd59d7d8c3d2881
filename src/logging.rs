//! Logging setup.
//!
//! Logs go to stderr so stdout stays clean for event output. `RUST_LOG` wins over the
//! configured filter.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Build the filter from `RUST_LOG`, falling back to `default_filter`.
pub fn parse_filter(env: Option<&str>, default_filter: &str) -> Result<EnvFilter> {
    match env.filter(|s| !s.trim().is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid RUST_LOG filter '{directives}'")),
        None => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter '{default_filter}'")),
    }
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init(default_filter: &str, json: bool) -> Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = parse_filter(env.as_deref(), default_filter)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let res = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    res.map_err(|e| anyhow::anyhow!("failed to install logger: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_default() {
        let filter = parse_filter(Some("jobctl=trace"), "info").unwrap();
        assert!(filter.to_string().contains("jobctl=trace"));
    }

    #[test]
    fn test_blank_env_falls_back() {
        let filter = parse_filter(Some("  "), "warn").unwrap();
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        let err = parse_filter(None, "jobctl=notalevel").unwrap_err();
        assert!(err.to_string().contains("invalid log filter"));
    }
}
