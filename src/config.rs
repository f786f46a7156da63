//! Runtime configuration.
//!
//! Settings come from three layers, later ones winning: a `KEY="value"` env
//! file, process environment variables with the same keys, and command line
//! flags applied by the binary. A missing env file is not an error.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{cache::CacheKind, upstream::DEFAULT_UPSTREAM_URL};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubescript-env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DATABASE_PATH: &str = "/var/lib/tubescript/transcripts.db";
pub const DEFAULT_CACHE_PATH: &str = "/var/lib/tubescript/cache.db";
pub const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Raw, partially specified configuration from one layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_path: Option<PathBuf>,
    pub upstream_url: Option<String>,
    pub upstream_timeout_secs: Option<u64>,
    pub cache_backend: Option<CacheKind>,
    pub cache_path: Option<PathBuf>,
    pub cache_ttl_secs: Option<u64>,
    pub proxy_secret: Option<String>,
}

impl EnvConfig {
    /// Applies one `KEY=value` pair. Unknown keys are ignored; empty values
    /// leave the field unset.
    fn apply(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        match key {
            "TUBESCRIPT_HOST" => self.host = Some(value.to_string()),
            "TUBESCRIPT_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing TUBESCRIPT_PORT from {origin}"))?;
                self.port = Some(port);
            }
            "TUBESCRIPT_DATABASE" => self.database_path = Some(PathBuf::from(value)),
            "TUBESCRIPT_UPSTREAM_URL" => self.upstream_url = Some(value.to_string()),
            "TUBESCRIPT_UPSTREAM_TIMEOUT_SECS" => {
                let secs: u64 = value.parse().with_context(|| {
                    format!("Parsing TUBESCRIPT_UPSTREAM_TIMEOUT_SECS from {origin}")
                })?;
                self.upstream_timeout_secs = Some(secs);
            }
            "TUBESCRIPT_CACHE_BACKEND" => {
                let kind: CacheKind = value
                    .parse()
                    .with_context(|| format!("Parsing TUBESCRIPT_CACHE_BACKEND from {origin}"))?;
                self.cache_backend = Some(kind);
            }
            "TUBESCRIPT_CACHE_PATH" => self.cache_path = Some(PathBuf::from(value)),
            "TUBESCRIPT_CACHE_TTL_SECS" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Parsing TUBESCRIPT_CACHE_TTL_SECS from {origin}"))?;
                self.cache_ttl_secs = Some(secs);
            }
            "TUBESCRIPT_PROXY_SECRET" => self.proxy_secret = Some(value.to_string()),
            _ => {}
        }
        Ok(())
    }

    pub fn from_pairs<I, K, V>(pairs: I, origin: &str) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = Self::default();
        for (key, value) in pairs {
            cfg.apply(key.as_ref(), value.as_ref(), origin)?;
        }
        Ok(cfg)
    }

    pub fn from_process_env() -> Result<Self> {
        Self::from_pairs(std::env::vars(), "the environment")
    }

    /// Fields set in `other` replace ours.
    pub fn merge(self, other: Self) -> Self {
        Self {
            host: other.host.or(self.host),
            port: other.port.or(self.port),
            database_path: other.database_path.or(self.database_path),
            upstream_url: other.upstream_url.or(self.upstream_url),
            upstream_timeout_secs: other.upstream_timeout_secs.or(self.upstream_timeout_secs),
            cache_backend: other.cache_backend.or(self.cache_backend),
            cache_path: other.cache_path.or(self.cache_path),
            cache_ttl_secs: other.cache_ttl_secs.or(self.cache_ttl_secs),
            proxy_secret: other.proxy_secret.or(self.proxy_secret),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub upstream_url: String,
    pub upstream_timeout: Duration,
    pub cache_backend: CacheKind,
    pub cache_path: PathBuf,
    pub cache_ttl: Duration,
    pub proxy_secret: Option<String>,
}

impl From<EnvConfig> for Settings {
    fn from(cfg: EnvConfig) -> Self {
        Self {
            host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cfg.port.unwrap_or(DEFAULT_PORT),
            database_path: cfg
                .database_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            upstream_url: cfg
                .upstream_url
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            upstream_timeout: Duration::from_secs(
                cfg.upstream_timeout_secs
                    .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
            ),
            cache_backend: cfg.cache_backend.unwrap_or(CacheKind::Memory),
            cache_path: cfg
                .cache_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH)),
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS)),
            proxy_secret: cfg.proxy_secret,
        }
    }
}

/// Reads a `KEY="value"` file. Returns `Ok(None)` when the file does not exist.
pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let pairs = content.lines().filter_map(|line| {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let (key, value_raw) = trimmed.split_once('=')?;
        Some((key.trim(), value_raw.trim().trim_matches('"')))
    });
    EnvConfig::from_pairs(pairs, &origin).map(Some)
}

/// Env file (if present) overlaid with the process environment.
pub fn load_settings_from(path: impl AsRef<Path>) -> Result<Settings> {
    let file = read_env_config(path.as_ref())?.unwrap_or_default();
    let env = EnvConfig::from_process_env()?;
    Ok(file.merge(env).into())
}
