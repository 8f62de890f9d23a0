use std::env;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use crate::error::{HosterError, HosterResult};

/// Process configuration, read from the environment at boot.
///
/// Boot fails with a configuration error (non-zero exit) when a
/// required variable is missing or malformed; nothing is re-read
/// after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base data directory: database, materialized config files,
    /// agent binaries.
    pub data_dir: PathBuf,
    /// 32-byte master key for encrypting node ssh keys and cloud
    /// credentials at rest.
    pub encryption_key: [u8; 32],
    /// API key sent to the external billing meter.
    pub billing_api_key: String,
    /// Base URL of the billing gateway.
    pub billing_url: String,
    /// Path of the meter endpoint on the billing gateway.
    pub billing_meter_path: String,
    /// Listen port for the entity API.
    pub api_port: u16,
    /// Listen port for the hostname reverse proxy.
    pub proxy_port: u16,
    /// Base domain for generated deployment hostnames.
    pub proxy_base_domain: String,
    /// Base domain for customer-facing custom domain CNAME targets.
    pub domain_base_domain: String,
    /// Per-node port range allocated to deployment proxy ports.
    pub deploy_port_range: RangeInclusive<u16>,
    /// Directory holding pre-compiled agent binaries, one per
    /// platform.
    pub agent_dir: PathBuf,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> HosterResult<Self> {
        let data_dir = PathBuf::from(var_or("DATA_DIR", "./data"));

        let key_str = env::var("NODES_ENCRYPTION_KEY")
            .map_err(|_| HosterError::Configuration("NODES_ENCRYPTION_KEY is not set".into()))?;
        let key_bytes = key_str.as_bytes();
        if key_bytes.len() != 32 {
            return Err(HosterError::Configuration(format!(
                "NODES_ENCRYPTION_KEY must be exactly 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        let mut encryption_key = [0u8; 32];
        encryption_key.copy_from_slice(key_bytes);

        let agent_dir = env::var("AGENT_DIR")
            .map_or_else(|_| data_dir.join("agents"), PathBuf::from);

        Ok(Self {
            agent_dir,
            data_dir,
            encryption_key,
            billing_api_key: var_or("BILLING_API_KEY", ""),
            billing_url: var_or("BILLING_URL", "http://127.0.0.1:9000"),
            billing_meter_path: var_or("BILLING_METER_PATH", "/_internal/meter"),
            api_port: parse_port("API_PORT", 8080)?,
            proxy_port: parse_port("PROXY_PORT", 8443)?,
            proxy_base_domain: var_or("PROXY_BASE_DOMAIN", "apps.localhost"),
            domain_base_domain: var_or("DOMAIN_BASE_DOMAIN", "apps.localhost"),
            deploy_port_range: parse_range("DEPLOY_PORT_RANGE", 30000..=39999)?,
        })
    }

    /// Directory that holds materialized config files for one
    /// deployment.
    #[must_use]
    pub fn deployment_config_dir(&self, deployment_id: &str) -> PathBuf {
        self.data_dir.join("configs").join(deployment_id)
    }

    /// Path of the sqlite database file.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("hoster.db")
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_port(name: &str, default: u16) -> HosterResult<u16> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| HosterError::Configuration(format!("{name} is not a valid port: {raw}"))),
    }
}

/// Parse a `low-high` inclusive port range.
fn parse_range(name: &str, default: RangeInclusive<u16>) -> HosterResult<RangeInclusive<u16>> {
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };

    let bad = || HosterError::Configuration(format!("{name} must look like 30000-39999: {raw}"));
    let (low, high) = raw.split_once('-').ok_or_else(bad)?;
    let low: u16 = low.trim().parse().map_err(|_| bad())?;
    let high: u16 = high.trim().parse().map_err(|_| bad())?;
    if low > high {
        return Err(bad());
    }
    Ok(low..=high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parses() {
        let r = parse_range("HOSTER_TEST_UNSET_RANGE", 30000..=39999).unwrap();
        assert_eq!(r, 30000..=39999);
    }

    #[test]
    fn config_dir_is_per_deployment() {
        let config = Config {
            data_dir: PathBuf::from("/var/lib/hoster"),
            encryption_key: [0u8; 32],
            billing_api_key: String::new(),
            billing_url: String::new(),
            billing_meter_path: String::new(),
            api_port: 8080,
            proxy_port: 8443,
            proxy_base_domain: "apps.example.com".into(),
            domain_base_domain: "apps.example.com".into(),
            deploy_port_range: 30000..=39999,
            agent_dir: PathBuf::from("/var/lib/hoster/agents"),
        };

        assert_eq!(
            config.deployment_config_dir("dep-1"),
            PathBuf::from("/var/lib/hoster/configs/dep-1")
        );
        assert_eq!(
            config.database_path(),
            PathBuf::from("/var/lib/hoster/hoster.db")
        );
    }
}
