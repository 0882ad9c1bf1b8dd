use points_ledger::CoreError;
use std::{env, str::FromStr, time::Duration};

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub sweep_interval: Duration,
    /// Run one sweep immediately instead of waiting a full interval.
    pub sweep_on_start: bool,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| CoreError::Configuration("DATABASE_URL must be set".into()))?;

        let max_connections: u32 =
            parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            return Err(CoreError::Configuration(
                "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
            ));
        }

        let interval_secs: u64 =
            parse_or(&lookup, "EXPIRY_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?;
        if interval_secs == 0 {
            return Err(CoreError::Configuration(
                "EXPIRY_SWEEP_INTERVAL_SECS must be at least 1".into(),
            ));
        }

        let sweep_on_start = match lookup("EXPIRY_SWEEP_ON_START") {
            None => true,
            Some(raw) => parse_flag(&raw).ok_or_else(|| {
                CoreError::Configuration(format!("EXPIRY_SWEEP_ON_START: invalid flag '{raw}'"))
            })?,
        };

        Ok(Self {
            database_url,
            max_connections,
            sweep_interval: Duration::from_secs(interval_secs),
            sweep_on_start,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| CoreError::Configuration(format!("{key}: invalid value '{raw}': {e}"))),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
