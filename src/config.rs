use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// 1 GiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 1 << 30;
pub const DEFAULT_RETENTION_HOURS: u64 = 7 * 24;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
    pub sweep_interval: Duration,
}

/// Settings owned by the blob store itself.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding the date buckets.
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub retention: chrono::Duration,
}

impl StoreConfig {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            retention: chrono::Duration::hours(DEFAULT_RETENTION_HOURS as i64),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file sharing with expiring download links")]
pub struct Args {
    /// Host to bind to (overrides EPHEMERAL_SHARE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides EPHEMERAL_SHARE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploads are stored (overrides EPHEMERAL_SHARE_UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Largest accepted upload in bytes (overrides EPHEMERAL_SHARE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<u64>,

    /// Hours an upload stays downloadable (overrides EPHEMERAL_SHARE_RETENTION_HOURS)
    #[arg(long)]
    pub retention_hours: Option<u64>,

    /// Seconds between expiry sweeps (overrides EPHEMERAL_SHARE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();
        Self::resolve(args, |key| env::var(key).ok())
    }

    /// Merge parsed arguments over values produced by `lookup`, then defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = lookup("EPHEMERAL_SHARE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "EPHEMERAL_SHARE_PORT")?.unwrap_or(8080);
        let env_upload_dir = lookup("EPHEMERAL_SHARE_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./uploads"));
        let env_max = parse_var(&lookup, "EPHEMERAL_SHARE_MAX_UPLOAD_BYTES")?
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        let env_retention = parse_var(&lookup, "EPHEMERAL_SHARE_RETENTION_HOURS")?
            .unwrap_or(DEFAULT_RETENTION_HOURS);
        let env_interval = parse_var(&lookup, "EPHEMERAL_SHARE_SWEEP_INTERVAL_SECS")?
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

        // --- Merge ---
        let max_upload_bytes = args.max_upload_bytes.unwrap_or(env_max);
        let retention_hours = args.retention_hours.unwrap_or(env_retention);
        let sweep_interval_secs = args.sweep_interval_secs.unwrap_or(env_interval);

        if max_upload_bytes == 0 {
            bail!("max upload size must be greater than zero");
        }
        if retention_hours == 0 {
            bail!("retention period must be at least one hour");
        }
        let retention_hours =
            i64::try_from(retention_hours).context("retention period is out of range")?;
        if sweep_interval_secs == 0 {
            bail!("sweep interval must be at least one second");
        }

        let mut store = StoreConfig::new(args.upload_dir.unwrap_or(env_upload_dir));
        store.max_upload_bytes = max_upload_bytes;
        store.retention = chrono::Duration::try_hours(retention_hours)
            .context("retention period is out of range")?;

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            store,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let cfg = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.store.upload_dir, PathBuf::from("./uploads"));
        assert_eq!(cfg.store.max_upload_bytes, 1 << 30);
        assert_eq!(cfg.store.retention, chrono::Duration::days(7));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(86_400));
    }

    #[test]
    fn args_override_env() {
        let args = Args {
            port: Some(9000),
            retention_hours: Some(1),
            ..Args::default()
        };
        let env = env_of(&[
            ("EPHEMERAL_SHARE_PORT", "7000"),
            ("EPHEMERAL_SHARE_HOST", "127.0.0.1"),
            ("EPHEMERAL_SHARE_RETENTION_HOURS", "48"),
        ]);
        let cfg = AppConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert_eq!(cfg.store.retention, chrono::Duration::hours(1));
    }

    #[test]
    fn rejects_unparsable_and_zero_values() {
        let bad_port = env_of(&[("EPHEMERAL_SHARE_PORT", "eighty")]);
        let err = AppConfig::resolve(Args::default(), bad_port).unwrap_err();
        assert!(err.to_string().contains("EPHEMERAL_SHARE_PORT"));

        let zero_interval = Args {
            sweep_interval_secs: Some(0),
            ..Args::default()
        };
        assert!(AppConfig::resolve(zero_interval, env_of(&[])).is_err());

        let zero_retention = env_of(&[("EPHEMERAL_SHARE_RETENTION_HOURS", "0")]);
        assert!(AppConfig::resolve(Args::default(), zero_retention).is_err());
    }
}
