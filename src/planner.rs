use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::compose::{self, CompositionSpec, MountSpec, ServiceSpec};
use crate::error::{HosterError, HosterResult};
use crate::orchestrator::{
    BindSpec, ContainerSpec, ContainerState, HealthCheckSpec, HealthState, NetworkSpec,
    Orchestrator, PortBindingSpec, VolumeSpec,
};
use crate::store::entities::{ConfigFile, ContainerRecord};

/// Label keys written onto every materialized resource.
pub const LABEL_DEPLOYMENT: &str = "deployment_id";
pub const LABEL_SERVICE: &str = "service";

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the planner needs to materialize one deployment on one
/// node.
pub struct PlanRequest<'a> {
    pub deployment_id: &'a str,
    /// Unique deployment name; container names derive from it.
    pub deployment_name: &'a str,
    pub composition: &'a str,
    pub variables: &'a BTreeMap<String, String>,
    /// Host port the routed service binds to.
    pub proxy_port: u16,
    /// Container port that receives the proxy port binding; falls
    /// back to the first declared port in the composition.
    pub routed_port: Option<u16>,
    pub config_files: &'a [ConfigFile],
    /// Host directory for materialized config files.
    pub config_dir: PathBuf,
}

/// Conventional network name for a deployment.
#[must_use]
pub fn network_name(deployment_id: &str) -> String {
    format!("hoster-{deployment_id}")
}

/// Conventional name for a deployment's named volume.
#[must_use]
pub fn volume_name(deployment_id: &str, volume: &str) -> String {
    format!("hoster-{deployment_id}-{volume}")
}

/// Parse, order, and materialize a deployment: config files, network,
/// volumes, images, then containers in dependency order.
///
/// Reruns against an intact deployment are no-ops: every create
/// accepts "already exists", and containers found with this
/// deployment's labels are reused and restarted rather than recreated.
/// On failure every container created in this invocation is removed
/// along with the network; volumes survive for data safety.
pub async fn materialize(
    orchestrator: &dyn Orchestrator,
    request: &PlanRequest<'_>,
) -> HosterResult<Vec<ContainerRecord>> {
    let spec = compose::parse(request.composition)?;
    let ordered = spec.ordered_services()?;
    let routed_port = request.routed_port.or_else(|| first_declared_port(&spec));

    let config_binds = write_config_files(orchestrator, request).await?;

    let network = network_name(request.deployment_id);
    orchestrator
        .create_network(&NetworkSpec {
            name: network.clone(),
            labels: deployment_labels(request.deployment_id),
        })
        .await?;

    for volume in spec.volumes.iter().filter(|v| !v.external) {
        orchestrator
            .create_volume(&VolumeSpec {
                name: volume_name(request.deployment_id, &volume.name),
                labels: deployment_labels(request.deployment_id),
            })
            .await?;
    }

    for service in &ordered {
        // A failed pull is only a warning: pre-pulled images are fine.
        if let Err(err) = orchestrator.pull_image(&service.image).await {
            warn!(image = %service.image, error = %err, "image pull failed, continuing");
        }
    }

    let mut created_this_run: Vec<String> = Vec::new();
    let mut records = Vec::with_capacity(ordered.len());

    for service in &ordered {
        let result = materialize_service(
            orchestrator,
            request,
            service,
            &network,
            routed_port,
            &config_binds,
            &mut created_this_run,
        )
        .await;

        match result {
            Ok(record) => records.push(record),
            Err(err) => {
                rollback(orchestrator, &network, &created_this_run).await;
                return Err(err);
            }
        }
    }

    info!(
        deployment = request.deployment_id,
        containers = records.len(),
        "deployment materialized"
    );
    Ok(records)
}

async fn materialize_service(
    orchestrator: &dyn Orchestrator,
    request: &PlanRequest<'_>,
    service: &ServiceSpec,
    network: &str,
    routed_port: Option<u16>,
    config_binds: &[BindSpec],
    created_this_run: &mut Vec<String>,
) -> HosterResult<ContainerRecord> {
    // Restart path: a container carrying this deployment's labels is
    // reused, not recreated.
    let mut labels = deployment_labels(request.deployment_id);
    labels.insert(LABEL_SERVICE.to_string(), service.name.clone());

    let existing = orchestrator.list_containers(true, &labels).await?;
    let id = if let Some(found) = existing.first() {
        debug!(
            service = %service.name,
            container = %found.id,
            "reusing existing container"
        );
        found.id.clone()
    } else {
        let spec = container_spec(request, service, network, routed_port, config_binds, labels);
        let id = orchestrator.create_container(&spec).await?;
        created_this_run.push(id.clone());
        id
    };

    match orchestrator.start_container(&id).await {
        Ok(()) | Err(HosterError::AlreadyRunning(_)) => {}
        Err(err) => return Err(err),
    }

    let ports = service
        .ports
        .iter()
        .map(|p| {
            let host = if Some(p.container_port) == routed_port {
                request.proxy_port
            } else {
                p.host_port.unwrap_or(0)
            };
            format!("0.0.0.0:{host}->{}/{}", p.container_port, p.protocol)
        })
        .collect();

    Ok(ContainerRecord {
        id,
        service: service.name.clone(),
        image: service.image.clone(),
        status: "running".to_string(),
        ports,
    })
}

fn container_spec(
    request: &PlanRequest<'_>,
    service: &ServiceSpec,
    network: &str,
    routed_port: Option<u16>,
    config_binds: &[BindSpec],
    labels: BTreeMap<String, String>,
) -> ContainerSpec {
    let env = service
        .environment
        .iter()
        .map(|(k, v)| format!("{k}={}", compose::substitute_variables(v, request.variables)))
        .collect();

    let mut ports = Vec::new();
    for mapping in &service.ports {
        let host_port = if Some(mapping.container_port) == routed_port {
            Some(request.proxy_port)
        } else {
            mapping.host_port
        };
        if let Some(host_port) = host_port {
            // 0.0.0.0 so the node accepts routed traffic from the
            // proxy host.
            ports.push(PortBindingSpec {
                host_ip: "0.0.0.0".to_string(),
                host_port,
                container_port: mapping.container_port,
                protocol: mapping.protocol.clone(),
            });
        }
    }

    let mut binds: Vec<BindSpec> = Vec::new();
    let mut tmpfs = Vec::new();
    for mount in &service.mounts {
        match mount {
            MountSpec::Bind {
                source,
                target,
                read_only,
            } => binds.push(BindSpec {
                source: source.clone(),
                target: target.clone(),
                read_only: *read_only,
            }),
            MountSpec::Named {
                volume,
                target,
                read_only,
            } => {
                // Anonymous volumes are left to the daemon.
                if !volume.is_empty() {
                    binds.push(BindSpec {
                        source: volume_name(request.deployment_id, volume),
                        target: target.clone(),
                        read_only: *read_only,
                    });
                }
            }
            MountSpec::Tmpfs { target } => tmpfs.push(target.clone()),
        }
    }
    binds.extend(config_binds.iter().cloned());

    let health = service.health.as_ref().map(|probe| HealthCheckSpec {
        test: probe.test.clone(),
        interval_secs: probe.interval.as_secs(),
        timeout_secs: probe.timeout.as_secs(),
        retries: probe.retries,
        start_period_secs: probe.start_period.as_secs(),
    });

    ContainerSpec {
        name: format!("{}-{}", request.deployment_name, service.name),
        image: service.image.clone(),
        command: service.command.clone(),
        entrypoint: service.entrypoint.clone(),
        env,
        labels,
        ports,
        binds,
        tmpfs,
        network: Some(network.to_string()),
        restart_policy: service.restart.clone(),
        memory_bytes: service.limits.memory_bytes,
        nano_cpus: service
            .limits
            .cpus
            .map(|cpus| (cpus * 1_000_000_000.0) as i64),
        health,
    }
}

/// Write declared config files under the deployment's config
/// directory and return read-only binds for every container.
async fn write_config_files(
    orchestrator: &dyn Orchestrator,
    request: &PlanRequest<'_>,
) -> HosterResult<Vec<BindSpec>> {
    let mut binds = Vec::with_capacity(request.config_files.len());
    for file in request.config_files {
        let host_path = request.config_dir.join(sanitize_file_name(&file.path));
        orchestrator
            .write_file(
                &host_path.to_string_lossy(),
                file.content.as_bytes(),
                file.mode.unwrap_or(0o644),
            )
            .await?;
        binds.push(BindSpec {
            source: host_path.to_string_lossy().to_string(),
            target: file.path.clone(),
            read_only: true,
        });
    }
    Ok(binds)
}

async fn rollback(orchestrator: &dyn Orchestrator, network: &str, created: &[String]) {
    warn!(
        %network,
        containers = created.len(),
        "materialization failed, rolling back this invocation"
    );
    for id in created {
        if let Err(err) = orchestrator.remove_container(id, true, false).await {
            warn!(container = %id, error = %err, "rollback container removal failed");
        }
    }
    if let Err(err) = orchestrator.remove_network(network).await {
        warn!(%network, error = %err, "rollback network removal failed");
    }
}

/// Wait until every container converges: probe-configured containers
/// must report healthy, probe-less ones must be running. A container
/// reporting unhealthy fails immediately; hitting the deadline while
/// anything is still pending is a timeout.
pub async fn await_converged(
    orchestrator: &dyn Orchestrator,
    container_ids: &[String],
    deadline: Duration,
) -> HosterResult<()> {
    let limit = Instant::now() + deadline;

    loop {
        let mut pending = None;
        for id in container_ids {
            let info = orchestrator.inspect_container(id).await?;
            match (info.state, info.health) {
                (_, HealthState::Unhealthy) => {
                    return Err(HosterError::NotRunning(format!(
                        "container {} is unhealthy",
                        info.name
                    )));
                }
                (ContainerState::Exited | ContainerState::Dead, _) => {
                    return Err(HosterError::NotRunning(format!(
                        "container {} exited (code {:?})",
                        info.name, info.exit_code
                    )));
                }
                (ContainerState::Running, HealthState::None | HealthState::Healthy) => {}
                _ => pending = Some(info.name),
            }
        }

        let Some(waiting_on) = pending else {
            return Ok(());
        };

        if Instant::now() + HEALTH_POLL_INTERVAL > limit {
            return Err(HosterError::Timeout(format!(
                "health convergence deadline reached waiting on {waiting_on}"
            )));
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}

fn deployment_labels(deployment_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_DEPLOYMENT.to_string(), deployment_id.to_string());
    labels
}

fn first_declared_port(spec: &CompositionSpec) -> Option<u16> {
    spec.services
        .iter()
        .flat_map(|s| s.ports.first())
        .map(|p| p.container_port)
        .next()
}

fn sanitize_file_name(container_path: &str) -> String {
    let name = Path::new(container_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_names() {
        assert_eq!(network_name("d1"), "hoster-d1");
        assert_eq!(volume_name("d1", "db-data"), "hoster-d1-db-data");
    }

    #[test]
    fn sanitized_file_names_keep_extension() {
        assert_eq!(sanitize_file_name("/etc/app/app.conf"), "app.conf");
        assert_eq!(sanitize_file_name("/weird/pa th/x y.yml"), "x_y.yml");
        assert_eq!(sanitize_file_name("/"), "config");
    }

    #[test]
    fn first_declared_port_walks_declaration_order() {
        let spec = compose::parse(
            "services:\n  api:\n    image: a\n    ports: ['8080:80']\n  web:\n    image: b\n    ports: ['3000']\n",
        )
        .unwrap();
        assert_eq!(first_declared_port(&spec), Some(80));
    }
}
