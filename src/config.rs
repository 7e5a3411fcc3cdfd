//! Service configuration from `RACKBOOK_*` environment variables.
//!
//! Unset variables fall back to defaults. A variable that is set but cannot
//! be parsed is an error.

use std::path::PathBuf;

use chrono::NaiveTime;

use crate::engine::{EngineSettings, GateConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub expected: &'static str,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={:?}: expected {}", self.key, self.value, self.expected)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub engine: EngineSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {

        let defaults = GateConfig::default();
        let gate = GateConfig {
            notification_window_enabled: parse_bool(
                "RACKBOOK_NOTIFICATION_WINDOW_ENABLED",
                get("RACKBOOK_NOTIFICATION_WINDOW_ENABLED"),
                defaults.notification_window_enabled,
            )?,
            window_day: parse_day(get("RACKBOOK_NOTIFICATION_DAY"), defaults.window_day)?,
            window_time: parse_time(get("RACKBOOK_NOTIFICATION_TIME"), defaults.window_time)?,
            hard_restriction_enabled: parse_bool(
                "RACKBOOK_HARD_RESTRICTION_ENABLED",
                get("RACKBOOK_HARD_RESTRICTION_ENABLED"),
                defaults.hard_restriction_enabled,
            )?,
            hard_restriction_hours: match get("RACKBOOK_HARD_RESTRICTION_HOURS") {
                None => defaults.hard_restriction_hours,
                Some(v) => v.trim().parse().map_err(|_| ConfigError {
                    key: "RACKBOOK_HARD_RESTRICTION_HOURS",
                    value: v,
                    expected: "a whole number of hours",
                })?,
            },
        };

        let alert_recipients = get("RACKBOOK_ALERT_RECIPIENTS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let legacy_tolerance_days = match get("RACKBOOK_LEGACY_TOLERANCE_DAYS") {
            None => 1,
            Some(v) => v.trim().parse::<u32>().map_err(|_| ConfigError {
                key: "RACKBOOK_LEGACY_TOLERANCE_DAYS",
                value: v,
                expected: "a whole number of days",
            })?,
        };

        Ok(Self {
            bind: get("RACKBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_num("RACKBOOK_PORT", get("RACKBOOK_PORT"), 5480, "a port number (0-65535)")?,
            data_dir: PathBuf::from(get("RACKBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parse_num(
                "RACKBOOK_MAX_CONNECTIONS",
                get("RACKBOOK_MAX_CONNECTIONS"),
                256,
                "a whole number of connections",
            )?,
            metrics_port: match get("RACKBOOK_METRICS_PORT") {
                None => None,
                Some(v) => Some(parse_num("RACKBOOK_METRICS_PORT", Some(v), 0, "a port number (0-65535)")?),
            },
            compact_threshold: parse_num(
                "RACKBOOK_COMPACT_THRESHOLD",
                get("RACKBOOK_COMPACT_THRESHOLD"),
                1000,
                "a whole number of WAL appends",
            )?,
            engine: EngineSettings {
                gate,
                alert_recipients,
                legacy_tolerance: chrono::Duration::days(legacy_tolerance_days as i64),
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("rackbook.wal")
    }
}

fn parse_num<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| ConfigError { key, value: v, expected }),
    }
}

fn parse_bool(key: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    match value.as_deref().map(str::trim) {
        None => Ok(default),
        Some("true") | Some("TRUE") | Some("1") => Ok(true),
        Some("false") | Some("FALSE") | Some("0") => Ok(false),
        Some(other) => Err(ConfigError {
            key,
            value: other.to_string(),
            expected: "true/false/1/0",
        }),
    }
}

/// `0`–`6` (Sunday first) or an English weekday name.
fn parse_day(value: Option<String>, default: u8) -> Result<u8, ConfigError> {
    let Some(v) = value else { return Ok(default) };
    let names = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];
    let lower = v.trim().to_ascii_lowercase();
    if let Ok(n) = lower.parse::<u8>()
        && n <= 6
    {
        return Ok(n);
    }
    names
        .iter()
        .position(|n| lower.get(..3).is_some_and(|p| *n == p))
        .map(|i| i as u8)
        .ok_or(ConfigError {
            key: "RACKBOOK_NOTIFICATION_DAY",
            value: v,
            expected: "0-6 (0 = Sunday) or a weekday name",
        })
}

fn parse_time(value: Option<String>, default: NaiveTime) -> Result<NaiveTime, ConfigError> {
    let Some(v) = value else { return Ok(default) };
    NaiveTime::parse_from_str(v.trim(), "%H:%M").map_err(|_| ConfigError {
        key: "RACKBOOK_NOTIFICATION_TIME",
        value: v,
        expected: "HH:MM",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.port, 5480);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.engine.gate, GateConfig::default());
        assert!(cfg.engine.alert_recipients.is_empty());
        assert_eq!(cfg.engine.legacy_tolerance, chrono::Duration::days(1));
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/rackbook.wal"));
    }

    #[test]
    fn gate_settings_parse() {
        let cfg = load(&[
            ("RACKBOOK_NOTIFICATION_WINDOW_ENABLED", "false"),
            ("RACKBOOK_NOTIFICATION_DAY", "Friday"),
            ("RACKBOOK_NOTIFICATION_TIME", "17:30"),
            ("RACKBOOK_HARD_RESTRICTION_HOURS", "24"),
            ("RACKBOOK_ALERT_RECIPIENTS", "ops@example.org, head@example.org,"),
            ("RACKBOOK_LEGACY_TOLERANCE_DAYS", "2"),
        ])
        .unwrap();
        let gate = &cfg.engine.gate;
        assert!(!gate.notification_window_enabled);
        assert_eq!(gate.window_day, 5);
        assert_eq!(gate.window_time, NaiveTime::from_hms_opt(17, 30, 0).unwrap());
        assert_eq!(gate.hard_restriction_hours, 24);
        assert_eq!(cfg.engine.alert_recipients, vec!["ops@example.org", "head@example.org"]);
        assert_eq!(cfg.engine.legacy_tolerance, chrono::Duration::days(2));
    }

    #[test]
    fn numeric_day_accepted() {
        assert_eq!(load(&[("RACKBOOK_NOTIFICATION_DAY", "0")]).unwrap().engine.gate.window_day, 0);
    }

    #[test]
    fn invalid_values_rejected() {
        let err = load(&[("RACKBOOK_NOTIFICATION_DAY", "9")]).unwrap_err();
        assert_eq!(err.key, "RACKBOOK_NOTIFICATION_DAY");
        assert!(load(&[("RACKBOOK_NOTIFICATION_TIME", "noon")]).is_err());
        assert!(load(&[("RACKBOOK_HARD_RESTRICTION_ENABLED", "maybe")]).is_err());
        assert!(load(&[("RACKBOOK_HARD_RESTRICTION_HOURS", "-3")]).is_err());
    }

    #[test]
    fn listener_numbers_must_fit() {
        let err = load(&[("RACKBOOK_PORT", "70000")]).unwrap_err();
        assert_eq!(err.key, "RACKBOOK_PORT");
        assert_eq!(err.value, "70000");
        assert!(load(&[("RACKBOOK_METRICS_PORT", "99999")]).is_err());
        assert!(load(&[("RACKBOOK_MAX_CONNECTIONS", "lots")]).is_err());
        assert!(load(&[("RACKBOOK_COMPACT_THRESHOLD", "-1")]).is_err());

        let cfg = load(&[("RACKBOOK_PORT", "6000"), ("RACKBOOK_METRICS_PORT", "9100")]).unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.metrics_port, Some(9100));
    }
}
