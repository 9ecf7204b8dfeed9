use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SILENCE_CEILING_MS: u64 = 15_000;
pub const DEFAULT_GRACE_MS: u64 = 100;
pub const DEFAULT_BROWSER_STALE_AFTER_SECS: u64 = 600;
pub const DEFAULT_BROWSER_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_host: String,
    pub bind_port: u16,
    pub log_level: String,
    pub default_shell: String,
    pub shell_args: Vec<String>,
    pub shell_env: Vec<(String, String)>,
    pub terminal_cols: u16,
    pub terminal_rows: u16,
    pub supersede_policy: SupersedePolicy,
    pub execute: ExecuteTiming,
    pub skills_dir: PathBuf,
    pub audit_log_file: PathBuf,
    pub audit_log_max_size_bytes: u64,
    pub browser_stale_after: Duration,
    pub browser_sweep_interval: Duration,
}

/// What happens to the previously active terminal session when a newer one is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersedePolicy {
    /// Leave the old process running; only its own connection can close it.
    Detach,
    /// Kill the old process as soon as it loses the active designation.
    Kill,
}

impl FromStr for SupersedePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "detach" => Ok(SupersedePolicy::Detach),
            "kill" => Ok(SupersedePolicy::Kill),
            _ => Err(anyhow::anyhow!("Invalid supersede policy: {} (expected 'detach' or 'kill')", s)),
        }
    }
}

/// Timing knobs of the command completion detector.
#[derive(Debug, Clone, Copy)]
pub struct ExecuteTiming {
    pub poll_interval: Duration,
    pub silence_ceiling: Duration,
    pub grace_period: Duration,
    pub max_wait: Option<Duration>,
}

impl Default for ExecuteTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            silence_ceiling: Duration::from_millis(DEFAULT_SILENCE_CEILING_MS),
            grace_period: Duration::from_millis(DEFAULT_GRACE_MS),
            max_wait: None,
        }
    }
}

fn platform_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else {
        "bash".to_string()
    }
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: '{}' ({})", key, raw, e)),
        _ => Ok(default),
    }
}

/// Parses `KEY=VALUE,KEY2=VALUE2`. Items without `=` are skipped.
fn parse_env_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|item| match item.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Some((k.trim().to_string(), v.to_string())),
            _ => {
                warn!(item = %item, "Ignoring malformed SHELL_ENV entry");
                None
            }
        })
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        let log_dir = PathBuf::from(".agent-shell-logs");
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: DEFAULT_PORT,
            log_level: "info".to_string(),
            default_shell: platform_shell(),
            shell_args: Vec::new(),
            shell_env: Vec::new(),
            terminal_cols: DEFAULT_COLS,
            terminal_rows: DEFAULT_ROWS,
            supersede_policy: SupersedePolicy::Detach,
            execute: ExecuteTiming::default(),
            skills_dir: PathBuf::from("skills"),
            audit_log_file: log_dir.join("execute.log"),
            audit_log_max_size_bytes: 10 * 1024 * 1024,
            browser_stale_after: Duration::from_secs(DEFAULT_BROWSER_STALE_AFTER_SECS),
            browser_sweep_interval: Duration::from_secs(DEFAULT_BROWSER_SWEEP_INTERVAL_SECS),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let bind_host = std::env::var("BIND_HOST").unwrap_or(defaults.bind_host);
        let bind_port = parse_env("BIND_PORT", defaults.bind_port)?;
        let log_level = std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level);

        let default_shell = std::env::var("DEFAULT_SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.default_shell);
        let shell_args = std::env::var("SHELL_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let shell_env = std::env::var("SHELL_ENV")
            .map(|s| parse_env_pairs(&s))
            .unwrap_or_default();

        let terminal_cols = parse_env("TERMINAL_COLS", defaults.terminal_cols)?;
        let terminal_rows = parse_env("TERMINAL_ROWS", defaults.terminal_rows)?;
        if terminal_cols == 0 || terminal_rows == 0 {
            anyhow::bail!("TERMINAL_COLS and TERMINAL_ROWS must be greater than zero");
        }

        let supersede_policy = parse_env("SUPERSEDE_POLICY", defaults.supersede_policy)?;

        let execute = ExecuteTiming {
            poll_interval: Duration::from_millis(parse_env(
                "EXECUTE_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            )?),
            silence_ceiling: Duration::from_millis(parse_env(
                "EXECUTE_SILENCE_CEILING_MS",
                DEFAULT_SILENCE_CEILING_MS,
            )?),
            grace_period: Duration::from_millis(parse_env("EXECUTE_GRACE_MS", DEFAULT_GRACE_MS)?),
            max_wait: match std::env::var("EXECUTE_MAX_WAIT_MS") {
                Ok(raw) if !raw.trim().is_empty() => Some(Duration::from_millis(
                    raw.trim()
                        .parse::<u64>()
                        .context("Invalid EXECUTE_MAX_WAIT_MS")?,
                )),
                _ => None,
            },
        };
        if execute.poll_interval.is_zero() {
            anyhow::bail!("EXECUTE_POLL_INTERVAL_MS must be greater than zero");
        }

        let skills_dir = match std::env::var("SKILLS_DIR") {
            Ok(s) if !s.is_empty() => expand_tilde(&s),
            _ => defaults.skills_dir,
        };

        let log_dir_base = std::env::var("LOG_DIR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .unwrap_or_else(|| PathBuf::from(".agent-shell-logs"));
        let audit_log_file = log_dir_base.join("execute.log");
        let audit_log_max_size_bytes = std::env::var("AUDIT_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|_| "10".to_string()) // Default 10 MB
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(defaults.audit_log_max_size_bytes);

        let browser_stale_after = Duration::from_secs(parse_env(
            "BROWSER_STALE_AFTER_SECS",
            DEFAULT_BROWSER_STALE_AFTER_SECS,
        )?);
        let browser_sweep_interval = Duration::from_secs(parse_env(
            "BROWSER_SWEEP_INTERVAL_SECS",
            DEFAULT_BROWSER_SWEEP_INTERVAL_SECS,
        )?);
        if browser_sweep_interval.is_zero() {
            anyhow::bail!("BROWSER_SWEEP_INTERVAL_SECS must be greater than zero");
        }

        Ok(Config {
            bind_host,
            bind_port,
            log_level,
            default_shell,
            shell_args,
            shell_env,
            terminal_cols,
            terminal_rows,
            supersede_policy,
            execute,
            skills_dir,
            audit_log_file,
            audit_log_max_size_bytes,
            browser_stale_after,
            browser_sweep_interval,
        })
    }
}
