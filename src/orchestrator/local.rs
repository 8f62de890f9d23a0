use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HealthConfig, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::StreamExt;
use tracing::{debug, warn};

use super::{
    ContainerInfo, ContainerSpec, ContainerState, ContainerStats, HealthState, HostInfo,
    LogOptions, NetworkSpec, Orchestrator, VolumeSpec,
};
use crate::error::{HosterError, HosterResult};

/// Orchestrator backed by a Docker daemon reachable from this process.
///
/// Used directly for nodes co-located with the server, and by the
/// agent binary against the node-local daemon.
pub struct LocalDocker {
    docker: Docker,
}

impl LocalDocker {
    /// Connect to the local daemon, preferring the default socket and
    /// falling back to the per-user Desktop socket when the default
    /// does not answer a ping.
    pub async fn connect() -> HosterResult<Self> {
        match Self::try_connect(None).await {
            Ok(client) => Ok(client),
            Err(primary_err) => {
                let Some(home) = std::env::var_os("HOME") else {
                    return Err(primary_err);
                };
                let desktop_socket =
                    format!("unix://{}/.docker/run/docker.sock", home.to_string_lossy());
                debug!(socket = %desktop_socket, "default docker socket unreachable, trying fallback");
                Self::try_connect(Some(&desktop_socket))
                    .await
                    .map_err(|_| primary_err)
            }
        }
    }

    /// Connect to an explicit socket path or TCP endpoint.
    pub async fn connect_to(endpoint: &str) -> HosterResult<Self> {
        Self::try_connect(Some(endpoint)).await
    }

    async fn try_connect(endpoint: Option<&str>) -> HosterResult<Self> {
        let docker = match endpoint {
            None => Docker::connect_with_local_defaults(),
            Some(endpoint) if endpoint.starts_with("tcp://") || endpoint.starts_with("http") => {
                Docker::connect_with_http(endpoint, 120, API_DEFAULT_VERSION)
            }
            Some(endpoint) => Docker::connect_with_socket(endpoint, 120, API_DEFAULT_VERSION),
        }
        .map_err(|e| HosterError::ConnectionFailed(format!("docker connect: {e}")))?;

        let docker = docker
            .negotiate_version()
            .await
            .map_err(|e| HosterError::ConnectionFailed(format!("docker version: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| HosterError::ConnectionFailed(format!("docker ping: {e}")))?;

        Ok(Self { docker })
    }
}

#[async_trait]
impl Orchestrator for LocalDocker {
    async fn ping(&self) -> HosterResult<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_error("ping", &e))
    }

    async fn host_info(&self) -> HosterResult<HostInfo> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| map_error("info", &e))?;
        let version = self
            .docker
            .version()
            .await
            .map_err(|e| map_error("version", &e))?;

        Ok(HostInfo {
            cpu_cores: info.ncpu.unwrap_or_default() as f64,
            memory_mb: u64::try_from(info.mem_total.unwrap_or_default() / (1024 * 1024))
                .unwrap_or_default(),
            // The daemon does not report disk capacity; the node's
            // declared capacity stays authoritative.
            disk_mb: 0,
            containers_running: u64::try_from(info.containers_running.unwrap_or_default())
                .unwrap_or_default(),
            docker_version: version.version.unwrap_or_default(),
            os: info.operating_system.unwrap_or_default(),
            architecture: info.architecture.unwrap_or_default(),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> HosterResult<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/{}", port.container_port, port.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.entry(key).or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: Some(port.host_ip.clone()),
                    host_port: Some(port.host_port.to_string()),
                });
        }

        let binds: Vec<String> = spec.binds.iter().map(super::BindSpec::to_bind_string).collect();
        let tmpfs: HashMap<String, String> = spec
            .tmpfs
            .iter()
            .map(|target| (target.clone(), String::new()))
            .collect();

        let restart_policy = spec.restart_policy.as_deref().map(|name| RestartPolicy {
            name: Some(match name {
                "always" => RestartPolicyNameEnum::ALWAYS,
                "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
                "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
                _ => RestartPolicyNameEnum::NO,
            }),
            maximum_retry_count: None,
        });

        let healthcheck = spec.health.as_ref().map(|h| HealthConfig {
            test: Some(h.test.clone()),
            interval: Some(secs_to_nanos(h.interval_secs)),
            timeout: Some(secs_to_nanos(h.timeout_secs)),
            retries: Some(i64::from(h.retries)),
            start_period: Some(secs_to_nanos(h.start_period_secs)),
            start_interval: None,
        });

        let host_config = HostConfig {
            binds: (!binds.is_empty()).then_some(binds),
            tmpfs: (!tmpfs.is_empty()).then_some(tmpfs),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            restart_policy,
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            entrypoint: spec.entrypoint.clone(),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            healthcheck,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        match self.docker.create_container(Some(options), config).await {
            Ok(response) => Ok(response.id),
            Err(err) => {
                let mapped = map_error("create-container", &err);
                if let HosterError::AlreadyExists(_) = mapped {
                    // Idempotent create: hand back the existing id so
                    // a retrying planner can proceed.
                    let existing = self.inspect_container(&spec.name).await?;
                    return Ok(existing.id);
                }
                Err(mapped)
            }
        }
    }

    async fn start_container(&self, id: &str) -> HosterResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error("start-container", &e))
    }

    async fn stop_container(&self, id: &str, graceful: Option<Duration>) -> HosterResult<()> {
        let options = graceful.map(|timeout| StopContainerOptions {
            t: i64::try_from(timeout.as_secs()).unwrap_or(10),
        });
        self.docker
            .stop_container(id, options)
            .await
            .map_err(|e| map_error("stop-container", &e))
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> HosterResult<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    v: volumes,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error("remove-container", &e))
    }

    async fn inspect_container(&self, id: &str) -> HosterResult<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error("inspect-container", &e))?;

        let state = inspect.state.as_ref();
        let status = state
            .and_then(|s| s.status.as_ref())
            .map_or(ContainerState::Unknown, |s| {
                ContainerState::parse(&s.to_string())
            });
        let health = state
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_ref())
            .map_or(HealthState::None, |h| HealthState::parse(&h.to_string()));

        let config = inspect.config.as_ref();

        Ok(ContainerInfo {
            id: inspect.id.clone().unwrap_or_default(),
            name: inspect
                .name
                .clone()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image: config
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            state: status,
            health,
            labels: config
                .and_then(|c| c.labels.clone())
                .map(|l| l.into_iter().collect())
                .unwrap_or_default(),
            ports: Vec::new(),
            started_at: state.and_then(|s| s.started_at.clone()),
            exit_code: state.and_then(|s| s.exit_code),
        })
    }

    async fn list_containers(
        &self,
        all: bool,
        labels: &BTreeMap<String, String>,
    ) -> HosterResult<Vec<ContainerInfo>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !labels.is_empty() {
            filters.insert(
                "label".to_string(),
                labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            );
        }

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| map_error("list-containers", &e))?;

        Ok(summaries
            .into_iter()
            .map(|summary| ContainerInfo {
                id: summary.id.unwrap_or_default(),
                name: summary
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: summary.image.unwrap_or_default(),
                state: summary
                    .state
                    .as_deref()
                    .map_or(ContainerState::Unknown, ContainerState::parse),
                health: HealthState::None,
                labels: summary
                    .labels
                    .map(|l| l.into_iter().collect())
                    .unwrap_or_default(),
                ports: Vec::new(),
                started_at: None,
                exit_code: None,
            })
            .collect())
    }

    async fn container_logs(&self, id: &str, options: &LogOptions) -> HosterResult<String> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                // Snapshot only; follow would never terminate.
                follow: false,
                stdout: true,
                stderr: true,
                since: options.since.unwrap_or_default(),
                until: options.until.unwrap_or_default(),
                timestamps: options.timestamps,
                tail: options
                    .tail
                    .map_or_else(|| "all".to_string(), |n| n.to_string()),
                ..Default::default()
            }),
        );

        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_error("logs", &e))?;
            output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(output)
    }

    async fn container_stats(&self, id: &str) -> HosterResult<ContainerStats> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );

        let stats = stream
            .next()
            .await
            .ok_or_else(|| HosterError::Internal(format!("no stats sample for {id}")))?
            .map_err(|e| map_error("stats", &e))?;

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or_default() as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or_default() as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
        let cpu_percent = if system_delta > 0.0 {
            (cpu_delta / system_delta) * online_cpus * 100.0
        } else {
            0.0
        };

        let (rx, tx) = stats.networks.as_ref().map_or((0, 0), |networks| {
            networks
                .values()
                .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
        });

        Ok(ContainerStats {
            cpu_percent,
            memory_usage_bytes: stats.memory_stats.usage.unwrap_or_default(),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or_default(),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
        })
    }

    async fn create_network(&self, spec: &NetworkSpec) -> HosterResult<String> {
        let options = CreateNetworkOptions::<String> {
            name: spec.name.clone(),
            driver: "bridge".to_string(),
            labels: spec.labels.clone().into_iter().collect(),
            ..Default::default()
        };

        match self.docker.create_network(options).await {
            Ok(response) => Ok(response.id.unwrap_or_else(|| spec.name.clone())),
            Err(err) => {
                let mapped = map_error("create-network", &err);
                if let HosterError::AlreadyExists(_) = mapped {
                    return Ok(spec.name.clone());
                }
                Err(mapped)
            }
        }
    }

    async fn remove_network(&self, name: &str) -> HosterResult<()> {
        self.docker
            .remove_network(name)
            .await
            .map_err(|e| map_error("remove-network", &e))
    }

    async fn connect_network(&self, network: &str, container: &str) -> HosterResult<()> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions::<String> {
                    container: container.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_error("connect-network", &e))
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> HosterResult<()> {
        self.docker
            .disconnect_network(
                network,
                DisconnectNetworkOptions::<String> {
                    container: container.to_string(),
                    force: false,
                },
            )
            .await
            .map_err(|e| map_error("disconnect-network", &e))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> HosterResult<String> {
        let options = CreateVolumeOptions::<String> {
            name: spec.name.clone(),
            labels: spec.labels.clone().into_iter().collect(),
            ..Default::default()
        };

        // Volume create is idempotent at the daemon level: creating
        // an existing name returns the existing volume.
        let volume = self
            .docker
            .create_volume(options)
            .await
            .map_err(|e| map_error("create-volume", &e))?;
        Ok(volume.name)
    }

    async fn remove_volume(&self, name: &str, force: bool) -> HosterResult<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await
            .map_err(|e| map_error("remove-volume", &e))
    }

    async fn list_volumes(&self, labels: &BTreeMap<String, String>) -> HosterResult<Vec<String>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if !labels.is_empty() {
            filters.insert(
                "label".to_string(),
                labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            );
        }

        let response = self
            .docker
            .list_volumes(Some(ListVolumesOptions::<String> { filters }))
            .await
            .map_err(|e| map_error("list-volumes", &e))?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    async fn pull_image(&self, image: &str) -> HosterResult<()> {
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, %status, "pull progress");
                    }
                }
                Err(err) => {
                    let mapped = map_error("pull-image", &err);
                    return Err(match mapped {
                        HosterError::NotFound(m) | HosterError::ImageNotFound(m) => {
                            HosterError::ImageNotFound(m)
                        }
                        HosterError::Internal(m) => HosterError::ImagePullFailed(m),
                        other => other,
                    });
                }
            }
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> HosterResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(err) => match map_error("inspect-image", &err) {
                HosterError::NotFound(_) | HosterError::ImageNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> HosterResult<()> {
        let path = std::path::Path::new(path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    async fn close(&self) -> HosterResult<()> {
        Ok(())
    }
}

const fn secs_to_nanos(secs: u64) -> i64 {
    (secs as i64).saturating_mul(1_000_000_000)
}

/// Map a daemon error into the taxonomy. The daemon reports failures
/// as status codes plus free-form messages; the message patterns here
/// turn those into kinds callers can program against.
fn map_error(verb: &str, err: &bollard::errors::Error) -> HosterError {
    use bollard::errors::Error as DockerError;

    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => {
            let lower = message.to_lowercase();
            if lower.contains("port is already allocated")
                || lower.contains("address already in use")
            {
                return HosterError::PortConflict(message.clone());
            }
            if lower.contains("no such image")
                || lower.contains("manifest unknown")
                || lower.contains("repository does not exist")
            {
                return HosterError::ImageNotFound(message.clone());
            }
            if lower.contains("already in use") || lower.contains("already exists") {
                return HosterError::AlreadyExists(message.clone());
            }
            if lower.contains("has active endpoints")
                || lower.contains("volume is in use")
                || lower.contains("is in use")
            {
                return HosterError::InUse(message.clone());
            }
            if lower.contains("is not running") || lower.contains("not started") {
                return HosterError::NotRunning(message.clone());
            }
            match *status_code {
                304 => HosterError::AlreadyRunning(message.clone()),
                404 => HosterError::NotFound(message.clone()),
                409 => HosterError::Conflict(message.clone()),
                _ => HosterError::Internal(format!("{verb}: {message}")),
            }
        }
        DockerError::RequestTimeoutError => {
            HosterError::Timeout(format!("{verb}: docker request timed out"))
        }
        other => {
            let text = other.to_string();
            let lower = text.to_lowercase();
            if lower.contains("connection refused")
                || lower.contains("connect")
                || lower.contains("socket")
            {
                warn!(verb, error = %text, "docker transport failure");
                HosterError::ConnectionFailed(format!("{verb}: {text}"))
            } else {
                HosterError::Internal(format!("{verb}: {text}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn port_conflicts_map_before_status() {
        // Port allocation failures surface as 500s with a telltale
        // message; kind must win over the status code.
        let err = map_error(
            "start-container",
            &server_error(500, "driver failed: Bind for 0.0.0.0:30001 failed: port is already allocated"),
        );
        assert_eq!(err.kind(), "port-conflict");
    }

    #[test]
    fn missing_image_maps_to_image_not_found() {
        let err = map_error("pull-image", &server_error(404, "No such image: ghost:latest"));
        assert_eq!(err.kind(), "image-not-found");
    }

    #[test]
    fn name_collision_maps_to_already_exists() {
        let err = map_error(
            "create-container",
            &server_error(
                409,
                "Conflict. The container name \"/hoster-d1-web\" is already in use",
            ),
        );
        assert_eq!(err.kind(), "already-exists");
    }

    #[test]
    fn active_endpoints_map_to_in_use() {
        let err = map_error(
            "remove-network",
            &server_error(403, "error: network hoster-d1 has active endpoints"),
        );
        assert_eq!(err.kind(), "in-use");
    }

    #[test]
    fn plain_missing_container_is_not_found() {
        let err = map_error(
            "inspect-container",
            &server_error(404, "No such container: deadbeef"),
        );
        assert_eq!(err.kind(), "not-found");
    }
}
