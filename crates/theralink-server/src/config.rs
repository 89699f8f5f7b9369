use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};

use theralink_gateway::connection::HeartbeatConfig;
use theralink_gateway::dispatcher::DEFAULT_BROADCAST_CAPACITY;

/// Secrets that must never reach a running deployment.
/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str =
    "theralink=debug,theralink_api=debug,theralink_gateway=debug,theralink_db=info,tower_http=debug";

const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "dev-secret-change-me", "secret"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub heartbeat: HeartbeatConfig,
    pub broadcast_capacity: usize,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("THERALINK_JWT_SECRET").context("THERALINK_JWT_SECRET is not set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            bail!("THERALINK_JWT_SECRET is a placeholder; set the identity provider's signing secret");
        }

        let db_path = lookup("THERALINK_DB_PATH").unwrap_or_else(|| "theralink.db".into());
        let host = lookup("THERALINK_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse_or(&lookup, "THERALINK_PORT", 3000)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let defaults = HeartbeatConfig::default();
        let heartbeat = HeartbeatConfig {
            interval: Duration::from_secs(parse_or(
                &lookup,
                "THERALINK_HEARTBEAT_SECS",
                defaults.interval.as_secs(),
            )?),
            missed_limit: parse_or(&lookup, "THERALINK_MISSED_HEARTBEATS", defaults.missed_limit)?,
            identify_timeout: Duration::from_secs(parse_or(
                &lookup,
                "THERALINK_IDENTIFY_TIMEOUT_SECS",
                defaults.identify_timeout.as_secs(),
            )?),
        };
        if heartbeat.interval.is_zero() {
            bail!("THERALINK_HEARTBEAT_SECS must be positive");
        }

        let broadcast_capacity = parse_or(
            &lookup,
            "THERALINK_BROADCAST_CAPACITY",
            DEFAULT_BROADCAST_CAPACITY,
        )?;

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(db_path),
            addr,
            heartbeat,
            broadcast_capacity,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let cfg = config(&[("THERALINK_JWT_SECRET", "s3cr3t-from-idp")]).unwrap();
        assert_eq!(cfg.addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(cfg.db_path, PathBuf::from("theralink.db"));
        assert_eq!(cfg.heartbeat.interval, Duration::from_secs(15));
        assert_eq!(cfg.heartbeat.missed_limit, 2);
        assert_eq!(cfg.broadcast_capacity, DEFAULT_BROADCAST_CAPACITY);
    }

    #[test]
    fn secret_is_required_and_not_a_placeholder() {
        assert!(config(&[]).is_err());
        assert!(config(&[("THERALINK_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("THERALINK_JWT_SECRET", "s3cr3t-from-idp"),
            ("THERALINK_PORT", "8080"),
            ("THERALINK_HEARTBEAT_SECS", "5"),
            ("THERALINK_MISSED_HEARTBEATS", "3"),
        ])
        .unwrap();
        assert_eq!(cfg.addr.port(), 8080);
        assert_eq!(cfg.heartbeat.detection_window(), Duration::from_secs(20));

        assert!(config(&[("THERALINK_JWT_SECRET", "s3cr3t"), ("THERALINK_PORT", "eighty")]).is_err());
    }

    #[test]
    fn default_log_filter_covers_every_crate() {
        for target in ["theralink=", "theralink_api=", "theralink_gateway=", "theralink_db="] {
            assert!(DEFAULT_LOG_FILTER.contains(target), "{target} missing");
        }
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
