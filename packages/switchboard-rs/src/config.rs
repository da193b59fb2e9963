use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Dispatcher configuration loaded from environment variables
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchboardConfig {
    /// Include command params in dispatch logs (`SWITCHBOARD_LOG_PARAMS`)
    pub log_params: bool,
    /// Cap on undrained result records (`SWITCHBOARD_MAX_PENDING_RESULTS`)
    pub max_pending_results: Option<usize>,
}

impl SwitchboardConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            log_params: lookup("SWITCHBOARD_LOG_PARAMS")
                .map(|raw| parse_bool(&raw))
                .transpose()
                .context("SWITCHBOARD_LOG_PARAMS must be true or false")?
                .unwrap_or(false),
            max_pending_results: lookup("SWITCHBOARD_MAX_PENDING_RESULTS")
                .filter(|raw| !raw.trim().is_empty())
                .map(|raw| raw.trim().parse::<usize>())
                .transpose()
                .context("SWITCHBOARD_MAX_PENDING_RESULTS must be a valid number")?,
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("unrecognised boolean {other:?}"),
    }
}
