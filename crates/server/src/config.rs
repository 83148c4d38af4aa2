//! Server configuration.
//!
//! Everything comes from the environment: a port, the database DSN (the
//! persistence home of the embedded record store), an optional cache DSN,
//! the accepted bearer tokens, and an optional schema bootstrap file.

use std::collections::HashSet;
use std::path::PathBuf;

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub database_dsn: String,
    pub cache_dsn: Option<String>,
    pub api_tokens: HashSet<String>,
    pub schema_path: Option<PathBuf>,
    /// How often the store snapshot is flushed to the database DSN.
    pub persist_interval_secs: u64,
}

impl Config {
    /// Reads the configuration from `EASYGRID_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let port = match std::env::var("EASYGRID_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("EASYGRID_PORT is not a port number: {raw}"))?,
            Err(_) => 3333,
        };
        let database_dsn =
            std::env::var("EASYGRID_DATABASE_DSN").unwrap_or_else(|_| "easygrid.db.json".into());
        let cache_dsn = std::env::var("EASYGRID_CACHE_DSN").ok().filter(|s| !s.is_empty());
        let api_tokens = std::env::var("EASYGRID_API_TOKENS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        let schema_path = std::env::var("EASYGRID_SCHEMA_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let persist_interval_secs = std::env::var("EASYGRID_PERSIST_INTERVAL_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(10);
        Ok(Self {
            port,
            database_dsn,
            cache_dsn,
            api_tokens,
            schema_path,
            persist_interval_secs,
        })
    }

    /// The database DSN interpreted as a snapshot file path. A `file:`
    /// prefix is accepted for parity with URL-shaped DSNs.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(
            self.database_dsn
                .strip_prefix("file:")
                .unwrap_or(&self.database_dsn),
        )
    }
}
