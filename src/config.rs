use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server settings, read from `INNKEEPER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Journal appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "innkeeper".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_connections = parsed(&lookup, "INNKEEPER_MAX_CONNECTIONS")?
            .unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "INNKEEPER_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(Self {
            port: parsed(&lookup, "INNKEEPER_PORT")?.unwrap_or(defaults.port),
            bind: lookup("INNKEEPER_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("INNKEEPER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("INNKEEPER_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold: parsed(&lookup, "INNKEEPER_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "INNKEEPER_METRICS_PORT")?,
            tls_cert: lookup("INNKEEPER_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("INNKEEPER_TLS_KEY").map(PathBuf::from),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("innkeeper.wal")
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port.map(|port| ([0, 0, 0, 0], port).into())
    }
}

fn parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        })
}
