use anyhow::{Context, Result};
use std::env;

/// Admin tool configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Used only to tag error output; never substitutes for a rule's zone.
    pub default_timezone: Option<String>,
    /// Seeds backoff jitter for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        let rng_seed = match env::var("ENGINE_RNG_SEED") {
            Ok(raw) => Some(
                raw.parse::<u64>()
                    .context("ENGINE_RNG_SEED must be an unsigned integer")?,
            ),
            Err(_) => None,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            default_timezone: env::var("ENGINE_DEFAULT_TIMEZONE").ok(),
            rng_seed,
        })
    }
}
