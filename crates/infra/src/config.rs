//! Engine configuration loaded from the environment.

use std::time::Duration;

/// Runtime knobs shared by the engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Longest wait for a per-aggregate lock before `Busy`.
    pub lock_timeout: Duration,
    /// Extra attempts after an optimistic commit conflict.
    pub commit_retries: u32,
    /// Lifetime of an idempotency record.
    pub idempotency_ttl: Duration,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(2000),
            commit_retries: 3,
            idempotency_ttl: Duration::from_secs(86_400),
            use_persistent_stores: false,
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Read `INVFLOW_*`, `USE_PERSISTENT_STORES` and `DATABASE_URL`.
    ///
    /// Unparsable values fall back to the default with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let lock_timeout_ms = parse_or(
            &lookup,
            "INVFLOW_LOCK_TIMEOUT_MS",
            defaults.lock_timeout.as_millis() as u64,
        );
        let commit_retries = parse_or(&lookup, "INVFLOW_COMMIT_RETRIES", defaults.commit_retries);
        let ttl_secs = parse_or(
            &lookup,
            "INVFLOW_IDEMPOTENCY_TTL_SECS",
            defaults.idempotency_ttl.as_secs(),
        );
        let use_persistent_stores = lookup("USE_PERSISTENT_STORES")
            .unwrap_or_else(|| "false".to_string())
            .eq_ignore_ascii_case("true");
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        Self {
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            commit_retries,
            idempotency_ttl: Duration::from_secs(ttl_secs),
            use_persistent_stores,
            database_url,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: core::str::FromStr + core::fmt::Display + Copy,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, fallback = %default, "invalid config value");
            default
        }),
    }
}
