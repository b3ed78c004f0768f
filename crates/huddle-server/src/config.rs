use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use huddle_api::RoomSettings;

/// Secrets that ship in sample `.env` files and must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "changeme", "secret", "your-secret-here"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HUDDLE_JWT_SECRET is not set")]
    MissingSecret,
    #[error("HUDDLE_JWT_SECRET is a placeholder value")]
    PlaceholderSecret,
    #[error("{key} has an invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub rooms: RoomSettings,
    pub cleanup_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, so tests don't touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("HUDDLE_JWT_SECRET")
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingSecret)?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.trim()) {
            return Err(ConfigError::PlaceholderSecret);
        }

        let db_path = PathBuf::from(lookup("HUDDLE_DB_PATH").unwrap_or_else(|| "huddle.db".into()));
        let host = lookup("HUDDLE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse(&lookup, "HUDDLE_PORT", 3000)?;
        let addr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "HUDDLE_HOST",
                value: host.clone(),
            })?;

        let room_ttl_hours: u32 = parse(&lookup, "HUDDLE_ROOM_TTL_HOURS", 24)?;
        if room_ttl_hours == 0 {
            return Err(ConfigError::Invalid {
                key: "HUDDLE_ROOM_TTL_HOURS",
                value: "0".into(),
            });
        }
        let anonymous_room_limit = parse(&lookup, "HUDDLE_ANON_ROOM_LIMIT", 1)?;
        let cleanup_secs: u64 = parse(&lookup, "HUDDLE_CLEANUP_INTERVAL_SECS", 3600)?;

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            rooms: RoomSettings {
                room_ttl_hours,
                anonymous_room_limit,
            },
            cleanup_interval: Duration::from_secs(cleanup_secs.max(1)),
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
