//! Gateway configuration
//!
//! All runtime configuration comes from environment variables; the values
//! and defaults are part of the deployment contract. `RUN_ENV` takes
//! precedence over the legacy `NODE_ENV` name.

use std::env;

use thiserror::Error;
use tracing::Level;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_WS_PATH: &str = "/websocket";
pub const DEFAULT_ADMIN_KEY: &str = "changeme-admin-key";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_OFFLINE_AFTER_MS: u64 = 120_000;
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 15_000;
pub const DEFAULT_RATE_LIMIT_MAX: u32 = 100;
pub const DEFAULT_COMMIT_HASH: &str = "dev";
pub const DEFAULT_VERIFY_INTERVAL_MS: i64 = 300_000;

/// Minimum admin key length accepted at startup.
pub const MIN_ADMIN_KEY_LEN: usize = 16;

/// Configuration errors abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
    #[error("ADMIN_KEY must be at least {MIN_ADMIN_KEY_LEN} characters")]
    AdminKeyTooShort,
    #[error("WS_PATH must start with '/'")]
    WsPathNotAbsolute,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunEnv {
    #[default]
    Development,
    Test,
    Production,
}

impl RunEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEnv::Development => "development",
            RunEnv::Test => "test",
            RunEnv::Production => "production",
        }
    }

    fn parse(input: &str) -> Option<RunEnv> {
        match input {
            "development" => Some(RunEnv::Development),
            "test" => Some(RunEnv::Test),
            "production" => Some(RunEnv::Production),
            _ => None,
        }
    }
}

/// Typed runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub env: RunEnv,
    pub port: u16,
    pub ws_path: String,
    pub admin_key: String,
    pub heartbeat_interval_ms: u64,
    pub offline_after_ms: u64,
    pub rate_limit_window_ms: u64,
    pub rate_limit_max: u32,
    pub log_level: Option<Level>,
    pub commit_hash: String,
    /// Verification sweep cadence; zero or negative disables the loop.
    pub verify_interval_ms: i64,
    pub persist_warp_status: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: RunEnv::default(),
            port: DEFAULT_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            admin_key: DEFAULT_ADMIN_KEY.to_string(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            offline_after_ms: DEFAULT_OFFLINE_AFTER_MS,
            rate_limit_window_ms: DEFAULT_RATE_LIMIT_WINDOW_MS,
            rate_limit_max: DEFAULT_RATE_LIMIT_MAX,
            log_level: None,
            commit_hash: DEFAULT_COMMIT_HASH.to_string(),
            verify_interval_ms: DEFAULT_VERIFY_INTERVAL_MS,
            persist_warp_status: true,
        }
    }
}

impl Config {
    /// Read configuration from the process environment and validate it.
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut cfg = Config::default();

        if let Some(raw) = read_env("RUN_ENV").or_else(|| read_env("NODE_ENV")) {
            cfg.env = RunEnv::parse(&raw).ok_or(ConfigError::Invalid {
                var: "RUN_ENV",
                message: format!("unknown environment '{raw}'"),
            })?;
        }
        if let Some(raw) = read_env("PORT") {
            cfg.port = parse_number("PORT", &raw)?;
        }
        if let Some(raw) = read_env("WS_PATH") {
            cfg.ws_path = raw;
        }
        if let Some(raw) = read_env("ADMIN_KEY") {
            cfg.admin_key = raw;
        }
        if let Some(raw) = read_env("WS_HEARTBEAT_INTERVAL") {
            cfg.heartbeat_interval_ms = parse_number("WS_HEARTBEAT_INTERVAL", &raw)?;
        }
        if let Some(raw) = read_env("OFFLINE_AFTER_MS") {
            cfg.offline_after_ms = parse_number("OFFLINE_AFTER_MS", &raw)?;
        }
        if let Some(raw) = read_env("RATE_LIMIT_WINDOW_MS") {
            cfg.rate_limit_window_ms = parse_number("RATE_LIMIT_WINDOW_MS", &raw)?;
        }
        if let Some(raw) = read_env("RATE_LIMIT_MAX") {
            cfg.rate_limit_max = parse_number("RATE_LIMIT_MAX", &raw)?;
        }
        if let Some(raw) = read_env("LOG_LEVEL") {
            cfg.log_level = Some(parse_log_level(&raw)?);
        }
        if let Some(raw) = read_env("COMMIT_HASH") {
            cfg.commit_hash = raw;
        }
        if let Some(raw) = read_env("VERIFY_INTERVAL_MS") {
            cfg.verify_interval_ms = parse_number("VERIFY_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = read_env("WARP_STATUS_PERSIST") {
            cfg.persist_warp_status = parse_bool("WARP_STATUS_PERSIST", &raw)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::WsPathNotAbsolute);
        }
        if self.admin_key.len() < MIN_ADMIN_KEY_LEN {
            return Err(ConfigError::AdminKeyTooShort);
        }
        Ok(())
    }

    /// Preset for tests: test env, a known admin key, and short windows so
    /// suites never wait on production cadences.
    pub fn for_testing() -> Config {
        Config {
            env: RunEnv::Test,
            admin_key: "test-admin-key-0123456789".to_string(),
            heartbeat_interval_ms: 5_000,
            offline_after_ms: 10_000,
            rate_limit_window_ms: 60_000,
            rate_limit_max: 100,
            verify_interval_ms: 0,
            ..Config::default()
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_number<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|err| ConfigError::Invalid {
        var,
        message: format!("{err}"),
    })
}

fn parse_bool(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ConfigError::Invalid {
            var,
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_log_level(raw: &str) -> Result<Level, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(ConfigError::Invalid {
            var: "LOG_LEVEL",
            message: format!("unknown level '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that mutate process environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "RUN_ENV",
        "NODE_ENV",
        "PORT",
        "WS_PATH",
        "ADMIN_KEY",
        "WS_HEARTBEAT_INTERVAL",
        "OFFLINE_AFTER_MS",
        "RATE_LIMIT_WINDOW_MS",
        "RATE_LIMIT_MAX",
        "LOG_LEVEL",
        "COMMIT_HASH",
        "VERIFY_INTERVAL_MS",
        "WARP_STATUS_PERSIST",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.env, RunEnv::Development);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.ws_path, "/websocket");
        assert_eq!(cfg.admin_key, "changeme-admin-key");
        assert_eq!(cfg.heartbeat_interval_ms, 30_000);
        assert_eq!(cfg.offline_after_ms, 120_000);
        assert_eq!(cfg.rate_limit_window_ms, 15_000);
        assert_eq!(cfg.rate_limit_max, 100);
        assert_eq!(cfg.commit_hash, "dev");
        assert_eq!(cfg.verify_interval_ms, 300_000);
        assert!(cfg.persist_warp_status);
        assert!(cfg.log_level.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("RUN_ENV", "production");
        env::set_var("PORT", "9090");
        env::set_var("WS_PATH", "/gateway");
        env::set_var("LOG_LEVEL", "warn");
        env::set_var("VERIFY_INTERVAL_MS", "-1");
        env::set_var("WARP_STATUS_PERSIST", "false");

        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.env, RunEnv::Production);
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.ws_path, "/gateway");
        assert_eq!(cfg.log_level, Some(Level::WARN));
        assert_eq!(cfg.verify_interval_ms, -1);
        assert!(!cfg.persist_warp_status);
        clear_env();
    }

    #[test]
    fn test_node_env_fallback() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();
        env::set_var("NODE_ENV", "test");
        assert_eq!(Config::from_env().unwrap().env, RunEnv::Test);

        env::set_var("RUN_ENV", "production");
        assert_eq!(Config::from_env().unwrap().env, RunEnv::Production);
        clear_env();
    }

    #[test]
    fn test_invalid_values_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        env::set_var("PORT", "not-a-port");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { var: "PORT", .. })
        ));
        clear_env();

        env::set_var("RUN_ENV", "staging");
        assert!(Config::from_env().is_err());
        clear_env();

        env::set_var("LOG_LEVEL", "verbose");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_validation_rules() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        env::set_var("WS_PATH", "websocket");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::WsPathNotAbsolute)
        ));
        clear_env();

        env::set_var("ADMIN_KEY", "short");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::AdminKeyTooShort)
        ));
        clear_env();
    }
}
