use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_LEASE_CONTAINER: &str = "broker-leases";
const DEFAULT_RECONCILE_INTERVAL: u64 = 300; // 5 minutes
const DEFAULT_CONTINUATION_WORKERS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub db_path: PathBuf,

    /// YAML file with the active pool definitions.
    pub pool_definitions: Option<PathBuf>,

    pub lease_container: String,

    /// Also the claim span of the orphan-pool leases.
    pub reconcile_interval_secs: u64,

    /// Continuation steps allowed to run at once.
    pub continuation_workers: usize,

    pub monitoring_enabled: bool,
}

fn default_db_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if let Some(path) = lookup("BROKER_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = lookup("APPDATA").unwrap_or_else(|| ".".to_string());
        PathBuf::from(appdata).join("pool-broker").join("broker.db")
    } else {
        let home = lookup("HOME").unwrap_or_else(|| ".".to_string());
        PathBuf::from(home).join(".pool-broker").join("broker.db")
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    match lookup(key).map(|s| s.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            db_path: default_db_path(&lookup),
            pool_definitions: lookup("BROKER_POOL_DEFINITIONS").map(PathBuf::from),
            lease_container: lookup("BROKER_LEASE_CONTAINER")
                .unwrap_or_else(|| DEFAULT_LEASE_CONTAINER.to_string()),
            reconcile_interval_secs: parsed(
                &lookup,
                "BROKER_RECONCILE_INTERVAL",
                DEFAULT_RECONCILE_INTERVAL,
            )
            .max(1),
            continuation_workers: parsed(
                &lookup,
                "BROKER_CONTINUATION_WORKERS",
                DEFAULT_CONTINUATION_WORKERS,
            )
            .max(1),
            monitoring_enabled: flag(&lookup, "BROKER_MONITORING_ENABLED", true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("HOME", "/home/broker")]));
        assert_eq!(config.db_path, PathBuf::from("/home/broker/.pool-broker/broker.db"));
        assert_eq!(config.pool_definitions, None);
        assert_eq!(config.lease_container, "broker-leases");
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.continuation_workers, 16);
        assert!(config.monitoring_enabled);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("BROKER_DB_PATH", "/var/lib/broker/broker.db"),
            ("BROKER_POOL_DEFINITIONS", "/etc/broker/pools.yaml"),
            ("BROKER_LEASE_CONTAINER", "fleet-leases"),
            ("BROKER_RECONCILE_INTERVAL", "60"),
            ("BROKER_CONTINUATION_WORKERS", "4"),
            ("BROKER_MONITORING_ENABLED", "false"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/var/lib/broker/broker.db"));
        assert_eq!(
            config.pool_definitions,
            Some(PathBuf::from("/etc/broker/pools.yaml"))
        );
        assert_eq!(config.lease_container, "fleet-leases");
        assert_eq!(config.reconcile_interval_secs, 60);
        assert_eq!(config.continuation_workers, 4);
        assert!(!config.monitoring_enabled);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("BROKER_RECONCILE_INTERVAL", "soon"),
            ("BROKER_CONTINUATION_WORKERS", "0"),
            ("BROKER_MONITORING_ENABLED", "maybe"),
        ]));
        assert_eq!(config.reconcile_interval_secs, 300);
        assert_eq!(config.continuation_workers, 1);
        assert!(config.monitoring_enabled);
    }
}
