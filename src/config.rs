use anyhow::Context;
use serde::Deserialize;

const PLACEHOLDER_SECRET: &str = "your-super-secret-key-change-in-production";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub token: TokenConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub secret: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
}

/// Broker connection parameters. Read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Prepended to every queue namespace: `<prefix><queueName>`.
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub monitor_interval_secs: u64,
    pub backlog_threshold: usize,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 300,
            backlog_threshold: 100,
            poll_interval_ms: 500,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    Config::from_lookup(|key| std::env::var(key).ok())
}

impl Config {
    /// Build the configuration from an arbitrary key lookup (the process
    /// environment in production, a map in tests).
    pub fn from_lookup<F>(get: F) -> anyhow::Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secret = get("JWT_SECRET").unwrap_or_else(|| PLACEHOLDER_SECRET.into());
        if secret == PLACEHOLDER_SECRET {
            let env_mode = get("APP_ENV").or_else(|| get("RUST_ENV")).unwrap_or_default();
            if env_mode == "production" {
                anyhow::bail!(
                    "JWT_SECRET is still the insecure placeholder. \
                     Set a proper signing secret before running in production."
                );
            }
            tracing::warn!("JWT_SECRET is not set — using insecure placeholder");
        }

        let access = get("JWT_EXPIRES_IN").unwrap_or_else(|| "24h".into());
        let refresh = get("JWT_REFRESH_EXPIRES_IN").unwrap_or_else(|| "7d".into());

        let defaults = QueueConfig::default();

        Ok(Config {
            port: parse_or(&get, "PORT", 3000)?,
            database_url: get("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/cil".into()),
            token: TokenConfig {
                secret,
                access_ttl_secs: parse_ttl(&access)
                    .with_context(|| format!("JWT_EXPIRES_IN: invalid duration '{}'", access))?,
                refresh_ttl_secs: parse_ttl(&refresh).with_context(|| {
                    format!("JWT_REFRESH_EXPIRES_IN: invalid duration '{}'", refresh)
                })?,
            },
            redis: RedisConfig {
                host: get("REDIS_HOST").unwrap_or_else(|| "localhost".into()),
                port: parse_or(&get, "REDIS_PORT", 6379)?,
                password: get("REDIS_PASSWORD").filter(|p| !p.is_empty()),
                db: parse_or(&get, "REDIS_DB", 1)?,
                key_prefix: get("REDIS_PREFIX").unwrap_or_else(|| "enterprise:queue:".into()),
            },
            queue: QueueConfig {
                monitor_interval_secs: parse_positive(
                    &get,
                    "QUEUE_MONITOR_INTERVAL_SECS",
                    defaults.monitor_interval_secs,
                )?,
                backlog_threshold: parse_or(
                    &get,
                    "QUEUE_BACKLOG_THRESHOLD",
                    defaults.backlog_threshold,
                )?,
                poll_interval_ms: parse_positive(
                    &get,
                    "QUEUE_POLL_INTERVAL_MS",
                    defaults.poll_interval_ms,
                )?,
            },
        })
    }
}

fn parse_or<F, T>(get: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}: invalid value '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

/// Like `parse_or`, for intervals that must be non-zero.
fn parse_positive<F>(get: &F, key: &str, default: u64) -> anyhow::Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, key, default)?;
    if value == 0 {
        anyhow::bail!("{}: must be greater than zero", key);
    }
    Ok(value)
}

/// Parse a lifetime such as "30s", "15m", "24h", "7d" or a bare number of
/// seconds. Returns `None` for anything else, including zero.
pub fn parse_ttl(s: &str) -> Option<u64> {
    let s = s.trim();
    let secs = if let Some(val) = s.strip_suffix('s') {
        val.parse().ok()?
    } else if let Some(val) = s.strip_suffix('m') {
        val.parse::<u64>().ok()?.checked_mul(60)?
    } else if let Some(val) = s.strip_suffix('h') {
        val.parse::<u64>().ok()?.checked_mul(3600)?
    } else if let Some(val) = s.strip_suffix('d') {
        val.parse::<u64>().ok()?.checked_mul(86400)?
    } else {
        s.parse().ok()?
    };
    (secs > 0).then_some(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_ttl() {
        assert_eq!(parse_ttl("30s"), Some(30));
        assert_eq!(parse_ttl("15m"), Some(900));
        assert_eq!(parse_ttl("24h"), Some(86400));
        assert_eq!(parse_ttl("7d"), Some(604800));
        assert_eq!(parse_ttl("3600"), Some(3600));
        assert_eq!(parse_ttl("  2h "), Some(7200));
        assert_eq!(parse_ttl("0"), None);
        assert_eq!(parse_ttl("soon"), None);
        assert_eq!(parse_ttl(""), None);
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.token.access_ttl_secs, 86400);
        assert_eq!(cfg.token.refresh_ttl_secs, 604800);
        assert_eq!(cfg.redis.host, "localhost");
        assert_eq!(cfg.redis.port, 6379);
        assert_eq!(cfg.redis.db, 1);
        assert_eq!(cfg.redis.key_prefix, "enterprise:queue:");
        assert!(cfg.redis.password.is_none());
        assert_eq!(cfg.queue.monitor_interval_secs, 300);
        assert_eq!(cfg.queue.backlog_threshold, 100);
    }

    #[test]
    fn test_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("JWT_SECRET", "s3cret"),
            ("JWT_EXPIRES_IN", "15m"),
            ("REDIS_PASSWORD", "pw"),
            ("REDIS_DB", "4"),
            ("QUEUE_BACKLOG_THRESHOLD", "25"),
        ]))
        .unwrap();
        assert_eq!(cfg.token.secret, "s3cret");
        assert_eq!(cfg.token.access_ttl_secs, 900);
        assert_eq!(cfg.redis.password.as_deref(), Some("pw"));
        assert_eq!(cfg.redis.db, 4);
        assert_eq!(cfg.queue.backlog_threshold, 25);
    }

    #[test]
    fn test_placeholder_secret_fatal_in_production() {
        let err = Config::from_lookup(lookup(&[("APP_ENV", "production")])).unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn test_malformed_values_rejected() {
        assert!(Config::from_lookup(lookup(&[("JWT_EXPIRES_IN", "forever")])).is_err());
        assert!(Config::from_lookup(lookup(&[("REDIS_PORT", "sixty")])).is_err());
    }

    #[test]
    fn test_zero_queue_intervals_rejected() {
        let err = Config::from_lookup(lookup(&[("QUEUE_POLL_INTERVAL_MS", "0")])).unwrap_err();
        assert!(err.to_string().contains("QUEUE_POLL_INTERVAL_MS"));

        let err =
            Config::from_lookup(lookup(&[("QUEUE_MONITOR_INTERVAL_SECS", "0")])).unwrap_err();
        assert!(err.to_string().contains("QUEUE_MONITOR_INTERVAL_SECS"));

        let cfg = Config::from_lookup(lookup(&[("QUEUE_POLL_INTERVAL_MS", "50")])).unwrap();
        assert_eq!(cfg.queue.poll_interval_ms, 50);
    }
}
