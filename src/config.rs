use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::limits::DEFAULT_STORE_TIMEOUT;

/// Process configuration, read once from `INNKEEP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub store_timeout: Duration,
    pub session_ttl: Duration,
    pub mail_queue: usize,
    pub mail_from: String,
    pub owner_email: String,
    pub metrics_port: Option<u16>,
    pub seed_rooms: Vec<String>,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            mail_queue: 256,
            mail_from: "admin@admin.com".into(),
            owner_email: "hoster@email.com".into(),
            metrics_port: None,
            seed_rooms: vec!["General's Quarters".into(), "Major's Suite".into()],
            admin_email: None,
            admin_password: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("ignoring unparseable {key}={raw}");
            default
        }),
        None => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let seed_rooms = match lookup("INNKEEP_SEED_ROOMS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => d.seed_rooms,
        };
        Self {
            bind: lookup("INNKEEP_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "INNKEEP_PORT", d.port),
            data_dir: lookup("INNKEEP_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            max_connections: parsed(&lookup, "INNKEEP_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parsed(&lookup, "INNKEEP_COMPACT_THRESHOLD", d.compact_threshold),
            store_timeout: Duration::from_millis(parsed(
                &lookup,
                "INNKEEP_STORE_TIMEOUT_MS",
                d.store_timeout.as_millis() as u64,
            )),
            session_ttl: Duration::from_secs(parsed(
                &lookup,
                "INNKEEP_SESSION_TTL_SECS",
                d.session_ttl.as_secs(),
            )),
            mail_queue: parsed(&lookup, "INNKEEP_MAIL_QUEUE", d.mail_queue),
            mail_from: lookup("INNKEEP_MAIL_FROM").unwrap_or(d.mail_from),
            owner_email: lookup("INNKEEP_OWNER_EMAIL").unwrap_or(d.owner_email),
            metrics_port: lookup("INNKEEP_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            seed_rooms,
            admin_email: lookup("INNKEEP_ADMIN_EMAIL"),
            admin_password: lookup("INNKEEP_ADMIN_PASSWORD"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("innkeep.wal")
    }
}
