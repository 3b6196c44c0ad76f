use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "mongo" | "mongodb" => Ok(StorageBackend::Mongo),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow!("unknown storage backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// HMAC secret shared with the identity service.
    pub secret_key: String,
    pub storage: StorageBackend,
    pub mongodb_uri: String,
    pub mongodb_database: String,
    /// Seed for the in-memory user directory.
    pub memory_users_file: Option<PathBuf>,
    /// Enables the cross-instance change relay.
    pub redis_url: Option<String>,
    pub transaction_max_attempts: u32,
    pub subscription_buffer: usize,
    /// How long an abandoned fan-out topic may linger before it is released.
    pub subscription_sweep: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let secret_key = lookup("SECRET_KEY").context("SECRET_KEY must be set")?;

        let port = match lookup("PORT") {
            Some(port) => port.parse().context("PORT must be a port number")?,
            None => 3030,
        };

        let storage = match lookup("STORAGE_BACKEND") {
            Some(backend) => backend.parse()?,
            None => StorageBackend::Mongo,
        };

        let transaction_max_attempts = match lookup("TRANSACTION_MAX_ATTEMPTS") {
            Some(value) => value
                .parse()
                .context("TRANSACTION_MAX_ATTEMPTS must be a positive integer")?,
            None => 5,
        };

        if transaction_max_attempts == 0 {
            return Err(anyhow!("TRANSACTION_MAX_ATTEMPTS must be at least 1"));
        }

        let subscription_buffer = match lookup("SUBSCRIPTION_BUFFER") {
            Some(value) => value
                .parse()
                .context("SUBSCRIPTION_BUFFER must be a positive integer")?,
            None => 16,
        };

        let subscription_sweep = match lookup("SUBSCRIPTION_SWEEP_SECS") {
            Some(value) => Duration::from_secs(
                value
                    .parse()
                    .context("SUBSCRIPTION_SWEEP_SECS must be a number of seconds")?,
            ),
            None => Duration::from_secs(5),
        };

        if subscription_sweep.is_zero() {
            return Err(anyhow!("SUBSCRIPTION_SWEEP_SECS must be at least 1"));
        }

        Ok(Config {
            host: lookup("HOST").unwrap_or("0.0.0.0".to_string()),
            port,
            secret_key,
            storage,
            mongodb_uri: lookup("MONGODB_URI").unwrap_or("mongodb://localhost:27017".to_string()),
            mongodb_database: lookup("MONGODB_DATABASE").unwrap_or("chat".to_string()),
            memory_users_file: lookup("MEMORY_USERS_FILE").map(PathBuf::from),
            redis_url: lookup("REDIS_URL").filter(|url| !url.is_empty()),
            transaction_max_attempts,
            subscription_buffer: subscription_buffer.max(1),
            subscription_sweep,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
