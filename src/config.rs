use crate::oci_registry::Platform;
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path, path::PathBuf};
use tracing::info;

pub static CONFIG_PATH_ENV: &str = "CONFIG_PATH";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Cron expression; without one a single scan runs and the process exits.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub webserver: Webserver,
    #[serde(default)]
    pub scan: Scan,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scan {
    pub page_size: u32,
    pub channel_capacity: usize,
}

impl Default for Scan {
    fn default() -> Self {
        Self {
            page_size: 500,
            channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub platform: Platform,
    pub ca_certificate_paths: Vec<PathBuf>,
    pub insecure_registries: Vec<String>,
    pub digest_cache_ttl_seconds: Option<u64>,
}

impl RegistryConfig {
    pub fn digest_cache_ttl(&self) -> Option<Duration> {
        self.digest_cache_ttl_seconds.map(Duration::from_secs)
    }
}

/// Loads the file named by `CONFIG_PATH`, or the defaults when it is unset.
pub fn load_config_from_env() -> Result<Config> {
    match env::var(CONFIG_PATH_ENV) {
        Ok(path) => load_config(path),
        Err(_) => {
            info!("{} is not set, using default configuration", CONFIG_PATH_ENV);
            Ok(Config::default())
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.scan.page_size == 0 || config.scan.channel_capacity == 0 {
        bail!("scan.pageSize and scan.channelCapacity must be greater than zero");
    }

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error if any env var is missing or regex fails.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        env::var(&caps[1]).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| caps[1].to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        bail!("Missing environment variable: {}", var_name);
    }
    Ok(result.into_owned())
}
