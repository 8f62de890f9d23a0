pub mod agent;
pub mod local;
pub mod ssh;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::HosterResult;

/// Default deadline for a single remote container operation.
pub const DEFAULT_VERB_TIMEOUT: Duration = Duration::from_secs(30);

/// The uniform container-operation surface.
///
/// Two implementations exist: [`local::LocalDocker`] talks to a Docker
/// daemon directly, [`agent::AgentClient`] tunnels every verb to the
/// agent binary on a remote node over SSH. Callers are written against
/// this trait and the error taxonomy, never against a transport.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn ping(&self) -> HosterResult<()>;

    /// Capacity and platform counters for the host.
    async fn host_info(&self) -> HosterResult<HostInfo>;

    /// Create a container; idempotent, returns the existing id when a
    /// container with the same name already exists.
    async fn create_container(&self, spec: &ContainerSpec) -> HosterResult<String>;

    async fn start_container(&self, id: &str) -> HosterResult<()>;

    async fn stop_container(&self, id: &str, graceful: Option<Duration>) -> HosterResult<()>;

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> HosterResult<()>;

    async fn inspect_container(&self, id: &str) -> HosterResult<ContainerInfo>;

    async fn list_containers(
        &self,
        all: bool,
        labels: &BTreeMap<String, String>,
    ) -> HosterResult<Vec<ContainerInfo>>;

    /// Polled log snapshot. The platform never streams; `follow` is
    /// accepted for protocol compatibility and ignored.
    async fn container_logs(&self, id: &str, options: &LogOptions) -> HosterResult<String>;

    /// Point-in-time resource sample.
    async fn container_stats(&self, id: &str) -> HosterResult<ContainerStats>;

    /// Create a network; idempotent on name collision.
    async fn create_network(&self, spec: &NetworkSpec) -> HosterResult<String>;

    async fn remove_network(&self, name: &str) -> HosterResult<()>;

    async fn connect_network(&self, network: &str, container: &str) -> HosterResult<()>;

    async fn disconnect_network(&self, network: &str, container: &str) -> HosterResult<()>;

    /// Create a named volume; idempotent on name collision.
    async fn create_volume(&self, spec: &VolumeSpec) -> HosterResult<String>;

    async fn remove_volume(&self, name: &str, force: bool) -> HosterResult<()>;

    async fn list_volumes(&self, labels: &BTreeMap<String, String>) -> HosterResult<Vec<String>>;

    async fn pull_image(&self, image: &str) -> HosterResult<()>;

    async fn image_exists(&self, image: &str) -> HosterResult<bool>;

    /// Write a file on the host filesystem (materialized deployment
    /// config files that containers bind-mount).
    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> HosterResult<()>;

    async fn close(&self) -> HosterResult<()>;
}

/// Everything needed to create one container. Serializable because the
/// agent protocol ships it as JSON on stdin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=VALUE` pairs.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBindingSpec>,
    #[serde(default)]
    pub binds: Vec<BindSpec>,
    #[serde(default)]
    pub tmpfs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nano_cpus: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBindingSpec {
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: String,
}

/// Filesystem bind: host path or named volume as source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl BindSpec {
    /// Docker-style bind string `source:target[:ro]`.
    #[must_use]
    pub fn to_bind_string(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub test: Vec<String>,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
    pub start_period_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    #[serde(default)]
    pub follow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tail: Option<u32>,
    /// Unix timestamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default)]
    pub timestamps: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
    Unknown,
}

impl ContainerState {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" | "up" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "removing" => Self::Removing,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// No health probe configured.
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthState {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "starting" => Self::Starting,
            "healthy" => Self::Healthy,
            "unhealthy" => Self::Unhealthy,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    pub health: HealthState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<PortBindingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub containers_running: u64,
    pub docker_version: String,
    pub os: String,
    pub architecture: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_string_forms() {
        let rw = BindSpec {
            source: "hoster-d1-data".into(),
            target: "/var/lib/data".into(),
            read_only: false,
        };
        assert_eq!(rw.to_bind_string(), "hoster-d1-data:/var/lib/data");

        let ro = BindSpec {
            source: "/etc/hoster/configs/d1/app.conf".into(),
            target: "/app/app.conf".into(),
            read_only: true,
        };
        assert_eq!(
            ro.to_bind_string(),
            "/etc/hoster/configs/d1/app.conf:/app/app.conf:ro"
        );
    }

    #[test]
    fn state_parsing_is_lenient() {
        assert_eq!(ContainerState::parse("Running"), ContainerState::Running);
        assert_eq!(ContainerState::parse("exited"), ContainerState::Exited);
        assert_eq!(ContainerState::parse("weird"), ContainerState::Unknown);
        assert_eq!(HealthState::parse("HEALTHY"), HealthState::Healthy);
        assert_eq!(HealthState::parse(""), HealthState::None);
    }

    #[test]
    fn container_spec_round_trips_as_json() {
        let spec = ContainerSpec {
            name: "hoster-d1-web".into(),
            image: "nginx:alpine".into(),
            env: vec!["A=1".into()],
            ports: vec![PortBindingSpec {
                host_ip: "0.0.0.0".into(),
                host_port: 30001,
                container_port: 80,
                protocol: "tcp".into(),
            }],
            ..Default::default()
        };

        let json = serde_json::to_string(&spec).unwrap();
        let back: ContainerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "hoster-d1-web");
        assert_eq!(back.ports, spec.ports);
    }
}
