//! Runtime configuration, read from the environment (and a `.env` file).

use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::Circuit;

/// Per-command response budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    /// Identify, status and reset.
    pub control: Duration,
    /// Continuity, shell bond and resistance.
    pub measurement: Duration,
    pub calibration: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(5),
            measurement: Duration::from_secs(10),
            calibration: Duration::from_secs(15),
        }
    }
}

/// Upper resistance limits a calibrated reading must stay within.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResistanceLimits {
    pub ts_max_milliohms: u32,
    /// Applied to each XLR signal pin on its own.
    pub xlr_max_milliohms: u32,
}

impl ResistanceLimits {
    pub fn max_milliohms(&self, circuit: Circuit) -> u32 {
        match circuit {
            Circuit::Ts => self.ts_max_milliohms,
            Circuit::Xlr => self.xlr_max_milliohms,
        }
    }
}

impl Default for ResistanceLimits {
    fn default() -> Self {
        Self {
            ts_max_milliohms: 500,
            xlr_max_milliohms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TesterConfig {
    /// Explicit serial port; auto-discovered when `None`.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Default read timeout of the serial handle.
    pub read_timeout: Duration,
    /// Power-on grace period after opening the port.
    pub settle_time: Duration,
    pub timeouts: CommandTimeouts,
    pub limits: ResistanceLimits,
    /// Use the in-process fixture simulator instead of hardware.
    pub simulate: bool,
    pub log_json: bool,
    /// Append completed reports to this JSON-lines file.
    pub report_log: Option<String>,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            read_timeout: Duration::from_secs(5),
            settle_time: Duration::from_secs(2),
            timeouts: CommandTimeouts::default(),
            limits: ResistanceLimits::default(),
            simulate: false,
            log_json: false,
            report_log: None,
        }
    }
}

impl TesterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(Self {
            port: get("CABLE_TESTER_PORT"),
            baud_rate: parse_or("CABLE_TESTER_BAUD", get("CABLE_TESTER_BAUD"), defaults.baud_rate)?,
            read_timeout: millis_or(
                "CABLE_TESTER_TIMEOUT_MS",
                get("CABLE_TESTER_TIMEOUT_MS"),
                defaults.read_timeout,
            )?,
            settle_time: millis_or(
                "CABLE_TESTER_SETTLE_MS",
                get("CABLE_TESTER_SETTLE_MS"),
                defaults.settle_time,
            )?,
            timeouts: defaults.timeouts,
            limits: ResistanceLimits {
                ts_max_milliohms: parse_or(
                    "CABLE_TESTER_TS_MAX_MOHM",
                    get("CABLE_TESTER_TS_MAX_MOHM"),
                    defaults.limits.ts_max_milliohms,
                )?,
                xlr_max_milliohms: parse_or(
                    "CABLE_TESTER_XLR_MAX_MOHM",
                    get("CABLE_TESTER_XLR_MAX_MOHM"),
                    defaults.limits.xlr_max_milliohms,
                )?,
            },
            simulate: bool_or("CABLE_TESTER_SIMULATE", get("CABLE_TESTER_SIMULATE"), false)?,
            log_json: bool_or("CABLE_TESTER_LOG_JSON", get("CABLE_TESTER_LOG_JSON"), false)?,
            report_log: get("CABLE_TESTER_REPORT_LOG"),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn millis_or(key: &'static str, value: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn bool_or(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}
