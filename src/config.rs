use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::calendar::DayWindow;
use crate::engine::SchedulingPolicy;
use crate::limits::{MAX_DAY_WINDOW_DAYS, MAX_SERVICE_DURATION_MINUTES};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both AGENDA_TLS_CERT and AGENDA_TLS_KEY must be set, or neither")]
    PartialTls,
}

/// Server settings, read once at startup from `AGENDA_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Password for the master user; falls back to `password`.
    pub master_password: Option<String>,
    pub master_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    /// Timezone given to tenants registered without one.
    pub default_timezone: Tz,
    pub default_duration_minutes: Option<u32>,
    /// `None` lets dashboards page to any day.
    pub day_window: Option<DayWindow>,
    pub store_timeout: Duration,
    pub store_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "agenda".into(),
            master_password: None,
            master_user: "master".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            default_timezone: chrono_tz::America::Sao_Paulo,
            default_duration_minutes: None,
            day_window: Some(DayWindow::default()),
            store_timeout: Duration::from_millis(5000),
            store_retries: 2,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let tls_cert = get("AGENDA_TLS_CERT");
        let tls_key = get("AGENDA_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let default_duration_minutes = match get("AGENDA_DEFAULT_DURATION_MINUTES") {
            None => defaults.default_duration_minutes,
            Some(raw) => {
                let minutes: u32 = parse_value("AGENDA_DEFAULT_DURATION_MINUTES", &raw)?;
                if minutes == 0 || minutes > MAX_SERVICE_DURATION_MINUTES {
                    return Err(invalid(
                        "AGENDA_DEFAULT_DURATION_MINUTES",
                        &raw,
                        format!("must be between 1 and {MAX_SERVICE_DURATION_MINUTES}"),
                    ));
                }
                Some(minutes)
            }
        };

        let day_window = match get("AGENDA_DAY_WINDOW_DAYS") {
            None => defaults.day_window,
            Some(raw) => parse_day_window(&raw)
                .map_err(|reason| invalid("AGENDA_DAY_WINDOW_DAYS", &raw, reason))?,
        };

        let max_connections = parse_var(&get, "AGENDA_MAX_CONNECTIONS", defaults.max_connections)?;
        if max_connections == 0 {
            return Err(invalid("AGENDA_MAX_CONNECTIONS", "0", "must be positive".into()));
        }

        Ok(Self {
            port: parse_var(&get, "AGENDA_PORT", defaults.port)?,
            bind: get("AGENDA_BIND").unwrap_or(defaults.bind),
            data_dir: get("AGENDA_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("AGENDA_PASSWORD").unwrap_or(defaults.password),
            master_password: get("AGENDA_MASTER_PASSWORD"),
            master_user: get("AGENDA_MASTER_USER").unwrap_or(defaults.master_user),
            max_connections,
            compact_threshold: parse_var(&get, "AGENDA_COMPACT_THRESHOLD", defaults.compact_threshold)?,
            tls_cert,
            tls_key,
            metrics_port: match get("AGENDA_METRICS_PORT") {
                Some(raw) => Some(parse_value("AGENDA_METRICS_PORT", &raw)?),
                None => None,
            },
            default_timezone: parse_var(&get, "AGENDA_DEFAULT_TIMEZONE", defaults.default_timezone)?,
            default_duration_minutes,
            day_window,
            store_timeout: Duration::from_millis(parse_var(
                &get,
                "AGENDA_STORE_TIMEOUT_MS",
                defaults.store_timeout.as_millis() as u64,
            )?),
            store_retries: parse_var(&get, "AGENDA_STORE_RETRIES", defaults.store_retries)?,
        })
    }

    pub fn policy(&self) -> SchedulingPolicy {
        SchedulingPolicy {
            default_duration_minutes: self.default_duration_minutes,
            store_timeout: self.store_timeout,
            store_retries: self.store_retries,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("agenda.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn invalid(var: &'static str, value: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason,
    }
}

fn parse_value<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, raw, e.to_string()))
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match get(var) {
        Some(raw) => parse_value(var, &raw),
        None => Ok(default),
    }
}

/// `off`, `N` (N days each way) or `BACK,FORWARD`.
fn parse_day_window(raw: &str) -> Result<Option<DayWindow>, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    let days = |s: &str| -> Result<u32, String> {
        let n: u32 = s.trim().parse().map_err(|e| format!("{e}"))?;
        if n > MAX_DAY_WINDOW_DAYS {
            return Err(format!("at most {MAX_DAY_WINDOW_DAYS} days"));
        }
        Ok(n)
    };
    let window = match raw.split_once(',') {
        Some((back, forward)) => DayWindow::new(days(back)?, days(forward)?),
        None => {
            let n = days(raw)?;
            DayWindow::new(n, n)
        }
    };
    Ok(Some(window))
}
