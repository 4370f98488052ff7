//! Configuration management for Aether Server
//!
//! Values come from a TOML file (written with defaults when missing) and
//! are then overridden by environment variables.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file path or a full `sqlite:` URL
    pub database_url: String,
    pub cleanup_interval_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    /// `30s`, `15m`, `12h`, `7d` or a bare number of seconds
    pub jwt_expires_in: String,
    pub refresh_expires_in: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest attachment a message may reference, in bytes
    pub max_file_size: u64,
}

impl AuthConfig {
    pub fn access_ttl_secs(&self) -> anyhow::Result<i64> {
        parse_duration_secs(&self.jwt_expires_in)
            .with_context(|| format!("invalid jwt_expires_in: {:?}", self.jwt_expires_in))
    }

    pub fn refresh_ttl_secs(&self) -> anyhow::Result<i64> {
        parse_duration_secs(&self.refresh_expires_in)
            .with_context(|| format!("invalid refresh_expires_in: {:?}", self.refresh_expires_in))
    }
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            config
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        if config.auth.jwt_secret == Config::default().auth.jwt_secret {
            tracing::warn!("JWT secret is the built-in default; set JWT_SECRET");
        }

        Ok(config)
    }

    /// Applies `JWT_SECRET`, `JWT_EXPIRES_IN`, `DATABASE_URL`,
    /// `MAX_FILE_SIZE` and `PORT` from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(expires_in) = lookup("JWT_EXPIRES_IN") {
            self.auth.jwt_expires_in = expires_in;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(size) = lookup("MAX_FILE_SIZE") {
            self.limits.max_file_size = size
                .trim()
                .parse()
                .with_context(|| format!("invalid MAX_FILE_SIZE: {size:?}"))?;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid PORT: {port:?}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("jwt_secret must not be empty");
        }
        self.auth.access_ttl_secs()?;
        self.auth.refresh_ttl_secs()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3001,
            },
            storage: StorageConfig {
                database_url: "./data/aether.db".to_string(),
                cleanup_interval_minutes: 60,
            },
            auth: AuthConfig {
                jwt_secret: "change-this-jwt-secret".to_string(),
                jwt_expires_in: "7d".to_string(),
                refresh_expires_in: "30d".to_string(),
            },
            limits: LimitsConfig {
                max_file_size: 10 * 1024 * 1024,
            },
        }
    }
}

/// Parses `Ns`, `Nm`, `Nh`, `Nd` or a bare number of seconds
pub fn parse_duration_secs(value: &str) -> anyhow::Result<i64> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&value[..idx], c),
        Some(_) => (value, 's'),
        None => bail!("empty duration"),
    };

    let amount: i64 = digits.parse()?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        other => bail!("unknown duration unit {other:?}"),
    };

    if amount <= 0 {
        bail!("duration must be positive");
    }
    amount
        .checked_mul(multiplier)
        .context("duration out of range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_secs("7d").unwrap(), 7 * 86_400);
        assert_eq!(parse_duration_secs("12h").unwrap(), 43_200);
        assert_eq!(parse_duration_secs("15m").unwrap(), 900);
        assert_eq!(parse_duration_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_secs("3600").unwrap(), 3600);
        assert!(parse_duration_secs("").is_err());
        assert!(parse_duration_secs("7w").is_err());
        assert!(parse_duration_secs("0d").is_err());
        assert!(parse_duration_secs("d").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("JWT_SECRET", "s3cret"),
            ("JWT_EXPIRES_IN", "1h"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("MAX_FILE_SIZE", "2048"),
            ("PORT", "8080"),
        ]);

        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.auth.jwt_secret, "s3cret");
        assert_eq!(config.auth.access_ttl_secs().unwrap(), 3600);
        assert_eq!(config.storage.database_url, "sqlite::memory:");
        assert_eq!(config.limits.max_file_size, 2048);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| (key == "PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.auth.jwt_expires_in, "7d");
        assert_eq!(parsed.limits.max_file_size, 10_485_760);
        parsed.validate().unwrap();
    }
}
