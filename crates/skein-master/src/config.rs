// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Tuning knobs of the workflow engines.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many workflow instances may process an event at the same time.
    pub exec_threads: usize,
    /// Upper bound for a single dispatch call.
    pub dispatch_timeout: Duration,
    /// How long a stop waits for a kill acknowledgement before forcing KILL.
    pub kill_timeout: Duration,
    /// Attempts for a state write before the engine degrades.
    pub persist_retry_attempts: u32,
    /// First backoff step between persistence attempts; doubles every attempt.
    pub persist_retry_base: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exec_threads: 100,
            dispatch_timeout: Duration::from_secs(30),
            kill_timeout: Duration::from_secs(30),
            persist_retry_attempts: 5,
            persist_retry_base: Duration::from_millis(50),
        }
    }
}

/// Skein master configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite file path or `sqlite:` URL
    pub database_url: String,
    /// Identity of this master in instance ownership and leases
    pub node_id: String,
    /// Engine tuning
    pub engine: EngineConfig,
    /// Interval between lease renewals
    pub heartbeat_interval: Duration,
    /// A master whose lease is older than this is considered dead
    pub lease_timeout: Duration,
    /// Interval between cron schedule polls
    pub scheduler_poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SKEIN_DATABASE_URL`: SQLite path or connection string
    ///
    /// Optional (with defaults):
    /// - `SKEIN_NODE_ID`: node identity (default: `master-<uuid>`)
    /// - `SKEIN_EXEC_THREADS`: concurrently processing instances (default: 100)
    /// - `SKEIN_HEARTBEAT_INTERVAL_SECS`: lease renewal interval (default: 10)
    /// - `SKEIN_LEASE_TIMEOUT_SECS`: lease expiry (default: 60)
    /// - `SKEIN_DISPATCH_TIMEOUT_SECS`: dispatch call timeout (default: 30)
    /// - `SKEIN_KILL_TIMEOUT_SECS`: kill acknowledgement timeout (default: 30)
    /// - `SKEIN_PERSIST_RETRY_ATTEMPTS`: state write attempts (default: 5)
    /// - `SKEIN_SCHEDULER_POLL_SECS`: cron poll interval (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SKEIN_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SKEIN_DATABASE_URL"))?;

        let node_id = std::env::var("SKEIN_NODE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("master-{}", uuid::Uuid::new_v4()));

        let exec_threads: usize = parse_positive("SKEIN_EXEC_THREADS", 100)? as usize;
        let heartbeat_interval = secs("SKEIN_HEARTBEAT_INTERVAL_SECS", 10)?;
        let lease_timeout = secs("SKEIN_LEASE_TIMEOUT_SECS", 60)?;
        if lease_timeout <= heartbeat_interval {
            return Err(ConfigError::Invalid(
                "SKEIN_LEASE_TIMEOUT_SECS",
                "must be greater than SKEIN_HEARTBEAT_INTERVAL_SECS",
            ));
        }

        let engine = EngineConfig {
            exec_threads,
            dispatch_timeout: secs("SKEIN_DISPATCH_TIMEOUT_SECS", 30)?,
            kill_timeout: secs("SKEIN_KILL_TIMEOUT_SECS", 30)?,
            persist_retry_attempts: parse_positive("SKEIN_PERSIST_RETRY_ATTEMPTS", 5)? as u32,
            ..EngineConfig::default()
        };

        Ok(Self {
            database_url,
            node_id,
            engine,
            heartbeat_interval,
            lease_timeout,
            scheduler_poll_interval: secs("SKEIN_SCHEDULER_POLL_SECS", 5)?,
        })
    }
}

fn parse_positive(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value: u64 = match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a positive integer"))?,
        Err(_) => default,
    };
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

fn secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_positive(key, default).map(Duration::from_secs)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 9] = [
        "SKEIN_DATABASE_URL",
        "SKEIN_NODE_ID",
        "SKEIN_EXEC_THREADS",
        "SKEIN_HEARTBEAT_INTERVAL_SECS",
        "SKEIN_LEASE_TIMEOUT_SECS",
        "SKEIN_DISPATCH_TIMEOUT_SECS",
        "SKEIN_KILL_TIMEOUT_SECS",
        "SKEIN_PERSIST_RETRY_ATTEMPTS",
        "SKEIN_SCHEDULER_POLL_SECS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SKEIN_DATABASE_URL", "sqlite:skein.db");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:skein.db");
        assert!(config.node_id.starts_with("master-"));
        assert_eq!(config.engine.exec_threads, 100);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.lease_timeout, Duration::from_secs(60));
        assert_eq!(config.engine.dispatch_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.kill_timeout, Duration::from_secs(30));
        assert_eq!(config.engine.persist_retry_attempts, 5);
        assert_eq!(config.scheduler_poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SKEIN_DATABASE_URL", "/var/lib/skein/skein.db");
        guard.set("SKEIN_NODE_ID", "10.0.0.5:5678");
        guard.set("SKEIN_EXEC_THREADS", "8");
        guard.set("SKEIN_HEARTBEAT_INTERVAL_SECS", "2");
        guard.set("SKEIN_LEASE_TIMEOUT_SECS", "9");
        guard.set("SKEIN_DISPATCH_TIMEOUT_SECS", "3");
        guard.set("SKEIN_KILL_TIMEOUT_SECS", "4");
        guard.set("SKEIN_PERSIST_RETRY_ATTEMPTS", "2");
        guard.set("SKEIN_SCHEDULER_POLL_SECS", "1");

        let config = Config::from_env().unwrap();

        assert_eq!(config.node_id, "10.0.0.5:5678");
        assert_eq!(config.engine.exec_threads, 8);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(config.lease_timeout, Duration::from_secs(9));
        assert_eq!(config.engine.dispatch_timeout, Duration::from_secs(3));
        assert_eq!(config.engine.kill_timeout, Duration::from_secs(4));
        assert_eq!(config.engine.persist_retry_attempts, 2);
        assert_eq!(config.scheduler_poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SKEIN_DATABASE_URL")));
        assert!(err.to_string().contains("SKEIN_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_exec_threads() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SKEIN_DATABASE_URL", "sqlite:skein.db");

        guard.set("SKEIN_EXEC_THREADS", "abc");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("SKEIN_EXEC_THREADS", _)
        ));

        guard.set("SKEIN_EXEC_THREADS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("SKEIN_EXEC_THREADS", _)
        ));
    }

    #[test]
    fn test_config_lease_must_exceed_heartbeat() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SKEIN_DATABASE_URL", "sqlite:skein.db");
        guard.set("SKEIN_HEARTBEAT_INTERVAL_SECS", "30");
        guard.set("SKEIN_LEASE_TIMEOUT_SECS", "30");

        assert!(matches!(
            Config::from_env().unwrap_err(),
            ConfigError::Invalid("SKEIN_LEASE_TIMEOUT_SECS", _)
        ));
    }

    #[test]
    fn test_blank_node_id_falls_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();
        guard.set("SKEIN_DATABASE_URL", "sqlite:skein.db");
        guard.set("SKEIN_NODE_ID", "  ");

        assert!(Config::from_env().unwrap().node_id.starts_with("master-"));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.exec_threads, 100);
        assert_eq!(config.persist_retry_attempts, 5);
    }
}
