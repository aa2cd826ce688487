//! Service settings loaded from the environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ferry_core::error::CoreError;
use ferry_core::rules::{parse_rules, Rule};
use ferry_db::LedgerConfig;
use ferry_engine::{ApprovalUnavailableMode, EngineConfig};
use ferry_rpc::reconnect::ReconnectConfig;
use ferry_rpc::ManagerConfig;

/// Holder leases last this many heartbeat intervals.
const LEASE_HEARTBEATS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{key} has invalid value {value:?}: expected {expected}")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("Cannot read rules file {path}: {source}")]
    RulesFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Rules(#[from] CoreError),
}

/// Everything the service reads from `FERRY_*` variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub rules_file: PathBuf,
    pub ledger_path: PathBuf,
    pub state_path: PathBuf,
    pub control_addr: String,
    /// `None` disables the outbound approval channel.
    pub approval_url: Option<String>,
    pub require_approval: bool,
    pub approval_unavailable: ApprovalUnavailableMode,
    pub start_paused: bool,
    pub max_jitter_secs: u64,
    pub supervisor_tick_secs: u64,
    pub inter_file_delay_ms: u64,
    pub move_attempts: u32,
    pub move_retry_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
    /// `0` disables the age cap.
    pub retention_days: u32,
    /// `0` disables the row cap.
    pub max_rows: i64,
    pub ledger_write_retries: u32,
    pub heartbeat_interval_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_secs: u64,
    pub memory_ceiling_mb: Option<u64>,
    pub log_json: bool,
}

impl Settings {
    /// Load settings from the process environment.
    ///
    /// | Env Var                        | Default                  |
    /// |--------------------------------|--------------------------|
    /// | `FERRY_RULES_FILE`             | `rules.json`             |
    /// | `FERRY_LEDGER_PATH`            | `ferry-ledger.db`        |
    /// | `FERRY_STATE_PATH`             | next to the ledger       |
    /// | `FERRY_CONTROL_ADDR`           | `127.0.0.1:47100`        |
    /// | `FERRY_APPROVAL_URL`           | `ws://127.0.0.1:47101`   |
    /// | `FERRY_REQUIRE_APPROVAL`       | `false`                  |
    /// | `FERRY_APPROVAL_UNAVAILABLE`   | `deny-file`              |
    /// | `FERRY_START_PAUSED`           | `false`                  |
    /// | `FERRY_MAX_JITTER_SECS`        | `10`                     |
    /// | `FERRY_SUPERVISOR_TICK_SECS`   | `5`                      |
    /// | `FERRY_INTER_FILE_DELAY_MS`    | `100`                    |
    /// | `FERRY_MOVE_ATTEMPTS`          | `3`                      |
    /// | `FERRY_MOVE_RETRY_DELAY_MS`    | `2000`                   |
    /// | `FERRY_SHUTDOWN_TIMEOUT_SECS`  | `10`                     |
    /// | `FERRY_RETENTION_DAYS`         | `90`                     |
    /// | `FERRY_MAX_ROWS`               | `100000`                 |
    /// | `FERRY_LEDGER_WRITE_RETRIES`   | `3`                      |
    /// | `FERRY_HEARTBEAT_INTERVAL_SECS`| `5`                      |
    /// | `FERRY_RECONNECT_INITIAL_MS`   | `1000`                   |
    /// | `FERRY_RECONNECT_MAX_SECS`     | `30`                     |
    /// | `FERRY_MEMORY_CEILING_MB`      | unset                    |
    /// | `FERRY_LOG_JSON`               | `false`                  |
    ///
    /// An empty `FERRY_APPROVAL_URL` disables the approval channel.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings from an in-memory map.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, SettingsError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let ledger_path = PathBuf::from(get("FERRY_LEDGER_PATH").unwrap_or_else(|| "ferry-ledger.db".into()));
        let state_path = get("FERRY_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| ledger_path.with_file_name("ferry-state.json"));
        let approval_url = match get("FERRY_APPROVAL_URL") {
            Some(url) if url.is_empty() => None,
            Some(url) => Some(url),
            None => Some("ws://127.0.0.1:47101".into()),
        };
        let approval_unavailable = match get("FERRY_APPROVAL_UNAVAILABLE") {
            Some(raw) => raw.parse().map_err(|_| SettingsError::Invalid {
                key: "FERRY_APPROVAL_UNAVAILABLE",
                value: raw,
                expected: "deny-file or skip-rule",
            })?,
            None => ApprovalUnavailableMode::default(),
        };

        Ok(Self {
            rules_file: PathBuf::from(get("FERRY_RULES_FILE").unwrap_or_else(|| "rules.json".into())),
            ledger_path,
            state_path,
            control_addr: get("FERRY_CONTROL_ADDR").unwrap_or_else(|| "127.0.0.1:47100".into()),
            approval_url,
            require_approval: flag(&get, "FERRY_REQUIRE_APPROVAL", false)?,
            approval_unavailable,
            start_paused: flag(&get, "FERRY_START_PAUSED", false)?,
            max_jitter_secs: number(&get, "FERRY_MAX_JITTER_SECS", 10)?,
            supervisor_tick_secs: number(&get, "FERRY_SUPERVISOR_TICK_SECS", 5)?,
            inter_file_delay_ms: number(&get, "FERRY_INTER_FILE_DELAY_MS", 100)?,
            move_attempts: number(&get, "FERRY_MOVE_ATTEMPTS", 3)?,
            move_retry_delay_ms: number(&get, "FERRY_MOVE_RETRY_DELAY_MS", 2000)?,
            shutdown_timeout_secs: number(&get, "FERRY_SHUTDOWN_TIMEOUT_SECS", 10)?,
            retention_days: number(&get, "FERRY_RETENTION_DAYS", 90)?,
            max_rows: number(&get, "FERRY_MAX_ROWS", 100_000)?,
            ledger_write_retries: number(&get, "FERRY_LEDGER_WRITE_RETRIES", 3)?,
            heartbeat_interval_secs: number(&get, "FERRY_HEARTBEAT_INTERVAL_SECS", 5)?,
            reconnect_initial_ms: number(&get, "FERRY_RECONNECT_INITIAL_MS", 1000)?,
            reconnect_max_secs: number(&get, "FERRY_RECONNECT_MAX_SECS", 30)?,
            memory_ceiling_mb: match get("FERRY_MEMORY_CEILING_MB") {
                Some(_) => Some(number(&get, "FERRY_MEMORY_CEILING_MB", 0)?),
                None => None,
            },
            log_json: flag(&get, "FERRY_LOG_JSON", false)?,
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_jitter: Duration::from_secs(self.max_jitter_secs),
            supervisor_tick: Duration::from_secs(self.supervisor_tick_secs.max(1)),
            inter_file_delay: Duration::from_millis(self.inter_file_delay_ms),
            move_attempts: self.move_attempts.max(1),
            move_retry_delay: Duration::from_millis(self.move_retry_delay_ms),
            require_approval: self.require_approval,
            approval_unavailable: self.approval_unavailable,
            start_paused: self.start_paused,
            shutdown_timeout: self.shutdown_timeout(),
            memory_ceiling_bytes: self.memory_ceiling_mb.map(|mb| mb * 1024 * 1024),
            ..EngineConfig::new(&self.rules_file, &self.state_path)
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            retention_days: (self.retention_days > 0).then_some(self.retention_days),
            max_rows: (self.max_rows > 0).then_some(self.max_rows),
            write_retries: self.ledger_write_retries.max(1),
            ..LedgerConfig::default()
        }
    }

    /// Outbound channel to the peer's approval endpoint, if configured.
    pub fn approval_channel(&self) -> Option<ManagerConfig> {
        let url = self.approval_url.as_ref()?;
        Some(ManagerConfig {
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(self.reconnect_initial_ms.max(1)),
                max_delay: Duration::from_secs(self.reconnect_max_secs.max(1)),
                ..ReconnectConfig::default()
            },
            ..ManagerConfig::new("approval", url.clone())
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// How long a session holder survives without heartbeats.
    pub fn session_lease(&self) -> Duration {
        self.heartbeat_interval() * LEASE_HEARTBEATS
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Read, parse and validate the rules file.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>, SettingsError> {
    let json = std::fs::read_to_string(path).map_err(|source| SettingsError::RulesFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_rules(&json)?)
}

fn number<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, SettingsError> {
    match get(key) {
        Some(raw) => raw.parse().map_err(|_| SettingsError::Invalid {
            key,
            value: raw,
            expected: "a non-negative integer",
        }),
        None => Ok(default),
    }
}

fn flag(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: bool,
) -> Result<bool, SettingsError> {
    match get(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(SettingsError::Invalid {
                key,
                value: raw,
                expected: "a boolean",
            }),
        },
        None => Ok(default),
    }
}
