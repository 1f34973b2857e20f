//! Server and room configuration.

use std::path::PathBuf;
use std::time::Duration;

use dojo_core::LogConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per session before it is dropped as lagging
    pub outbox_capacity: usize,
    /// Commands buffered per room actor
    pub command_capacity: usize,
    /// Room housekeeping period (liveness sweep, presence flush, grace timer)
    pub tick_interval: Duration,
    /// Sessions silent for longer than this are dropped
    pub liveness_timeout: Duration,
    /// How long an empty room is kept before it is destroyed
    pub grace_period: Duration,
    /// Minimum spacing between presence broadcasts of one room
    pub presence_interval: Duration,
    /// Operations kept per room for incremental resync
    pub log_retention: usize,
    /// Checkpoint every N revisions (0 = only on destroy and on demand)
    pub checkpoint_every: u64,
    /// Largest accepted insert text / delete length, in code points
    pub max_op_chars: usize,
    /// Checkpoint storage path (None = in-memory checkpoints only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            command_capacity: 1024,
            tick_interval: Duration::from_millis(250),
            liveness_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
            presence_interval: Duration::from_millis(50),
            log_retention: 10_000,
            checkpoint_every: 500,
            max_op_chars: 64 * 1024,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Short timers and small queues for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbox_capacity: 64,
            command_capacity: 64,
            tick_interval: Duration::from_millis(20),
            liveness_timeout: Duration::from_secs(10),
            grace_period: Duration::from_millis(200),
            presence_interval: Duration::from_millis(10),
            log_retention: 100,
            checkpoint_every: 0,
            max_op_chars: 4096,
            storage_path: None,
        }
    }

    /// Retention settings for a room's operation log.
    pub fn log_config(&self) -> LogConfig {
        LogConfig::with_retention(self.log_retention)
    }

    /// Most log entries replayed to one session before falling back to a
    /// snapshot. Leaves room in the outbox for the `joined` marker and
    /// concurrent broadcasts.
    pub fn max_replay(&self) -> usize {
        (self.outbox_capacity / 2).max(1)
    }

    /// Apply `DOJO_*` environment overrides.
    pub fn from_env(mut self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok());
        self
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = var("DOJO_BIND") {
            self.bind_addr = bind;
        }
        if let Some(path) = var("DOJO_STORAGE") {
            self.storage_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(n) = parse_var(&var, "DOJO_RETENTION") {
            self.log_retention = n as usize;
        }
        if let Some(secs) = parse_var(&var, "DOJO_GRACE_SECS") {
            self.grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var(&var, "DOJO_LIVENESS_SECS") {
            self.liveness_timeout = Duration::from_secs(secs);
        }
    }
}

fn parse_var(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a non-negative integer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbox_capacity, 256);
        assert_eq!(config.log_retention, 10_000);
        assert!(config.storage_path.is_none());
        assert_eq!(config.max_replay(), 128);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DOJO_BIND", "0.0.0.0:8080"),
            ("DOJO_STORAGE", "/tmp/dojo"),
            ("DOJO_RETENTION", "42"),
            ("DOJO_GRACE_SECS", "5"),
            ("DOJO_LIVENESS_SECS", "nope"),
        ]
        .into_iter()
        .collect();
        let mut config = ServerConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.storage_path, Some(PathBuf::from("/tmp/dojo")));
        assert_eq!(config.log_retention, 42);
        assert_eq!(config.grace_period, Duration::from_secs(5));
        // Unparseable values keep the default.
        assert_eq!(config.liveness_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_empty_storage_disables_persistence() {
        let mut config = ServerConfig {
            storage_path: Some(PathBuf::from("db")),
            ..ServerConfig::default()
        };
        config.apply_overrides(|k| (k == "DOJO_STORAGE").then(String::new));
        assert!(config.storage_path.is_none());
    }
}
