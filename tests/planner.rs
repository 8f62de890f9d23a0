//! Planner materialization against a scripted orchestrator: ordering,
//! idempotent restart, rollback, and health convergence.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use hoster::error::{HosterError, HosterResult};
use hoster::orchestrator::{
    ContainerInfo, ContainerSpec, ContainerState, ContainerStats, HealthState, HostInfo,
    LogOptions, NetworkSpec, Orchestrator, VolumeSpec,
};
use hoster::planner::{self, PlanRequest};

const WORDPRESS: &str = "
services:
  wordpress:
    image: wordpress:6
    depends_on: [db]
    ports: ['80']
    environment:
      WORDPRESS_DB_PASSWORD: ${DB_PASSWORD}
  db:
    image: mysql:8.0
    environment:
      MYSQL_ROOT_PASSWORD: ${DB_ROOT_PASSWORD}
    volumes:
      - db-data:/var/lib/mysql
volumes:
  db-data:
";

#[derive(Default)]
struct Scripted {
    /// Containers present before this run (restart path).
    preexisting: Vec<ContainerInfo>,
    /// Service whose create call should fail, with the error kind.
    fail_create: Option<(String, &'static str)>,
    log: Mutex<Vec<String>>,
    /// Health sequence per container id; inspect pops front.
    health: Mutex<BTreeMap<String, Vec<(ContainerState, HealthState)>>>,
}

impl Scripted {
    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Orchestrator for Scripted {
    async fn ping(&self) -> HosterResult<()> {
        Ok(())
    }

    async fn host_info(&self) -> HosterResult<HostInfo> {
        Ok(HostInfo::default())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> HosterResult<String> {
        if let Some((service, kind)) = &self.fail_create {
            if spec.labels.get("service") == Some(service) {
                self.record(format!("create-failed:{service}"));
                return Err(HosterError::from_kind(kind, "scripted failure"));
            }
        }
        self.record(format!("create:{}", spec.name));
        Ok(format!("id-{}", spec.name))
    }

    async fn start_container(&self, id: &str) -> HosterResult<()> {
        self.record(format!("start:{id}"));
        Ok(())
    }

    async fn stop_container(&self, id: &str, _graceful: Option<Duration>) -> HosterResult<()> {
        self.record(format!("stop:{id}"));
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool, _volumes: bool) -> HosterResult<()> {
        self.record(format!("remove-container:{id}"));
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> HosterResult<ContainerInfo> {
        let mut health = self.health.lock().unwrap();
        let states = health.get_mut(id).ok_or_else(|| {
            HosterError::NotFound(format!("container {id}"))
        })?;
        let (state, health_state) = if states.len() > 1 {
            states.remove(0)
        } else {
            states[0]
        };
        Ok(ContainerInfo {
            id: id.to_string(),
            name: id.to_string(),
            image: String::new(),
            state,
            health: health_state,
            labels: BTreeMap::new(),
            ports: Vec::new(),
            started_at: None,
            exit_code: None,
        })
    }

    async fn list_containers(
        &self,
        _all: bool,
        labels: &BTreeMap<String, String>,
    ) -> HosterResult<Vec<ContainerInfo>> {
        Ok(self
            .preexisting
            .iter()
            .filter(|c| labels.iter().all(|(k, v)| c.labels.get(k) == Some(v)))
            .cloned()
            .collect())
    }

    async fn container_logs(&self, _id: &str, _options: &LogOptions) -> HosterResult<String> {
        Ok(String::new())
    }

    async fn container_stats(&self, _id: &str) -> HosterResult<ContainerStats> {
        Ok(ContainerStats::default())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> HosterResult<String> {
        self.record(format!("create-network:{}", spec.name));
        Ok(spec.name.clone())
    }

    async fn remove_network(&self, name: &str) -> HosterResult<()> {
        self.record(format!("remove-network:{name}"));
        Ok(())
    }

    async fn connect_network(&self, _network: &str, _container: &str) -> HosterResult<()> {
        Ok(())
    }

    async fn disconnect_network(&self, _network: &str, _container: &str) -> HosterResult<()> {
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> HosterResult<String> {
        self.record(format!("create-volume:{}", spec.name));
        Ok(spec.name.clone())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> HosterResult<()> {
        self.record(format!("remove-volume:{name}"));
        Ok(())
    }

    async fn list_volumes(&self, _labels: &BTreeMap<String, String>) -> HosterResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn pull_image(&self, image: &str) -> HosterResult<()> {
        self.record(format!("pull:{image}"));
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> HosterResult<bool> {
        Ok(true)
    }

    async fn write_file(&self, path: &str, _content: &[u8], _mode: u32) -> HosterResult<()> {
        self.record(format!("write-file:{path}"));
        Ok(())
    }

    async fn close(&self) -> HosterResult<()> {
        Ok(())
    }
}

fn request<'a>(variables: &'a BTreeMap<String, String>) -> PlanRequest<'a> {
    PlanRequest {
        deployment_id: "dep-1",
        deployment_name: "blog-x7k2m9",
        composition: WORDPRESS,
        variables,
        proxy_port: 30001,
        routed_port: None,
        config_files: &[],
        config_dir: PathBuf::from("/tmp/hoster-tests/configs/dep-1"),
    }
}

fn secrets() -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("DB_PASSWORD".to_string(), "s3cr3t".to_string());
    vars.insert("DB_ROOT_PASSWORD".to_string(), "r00t".to_string());
    vars
}

#[tokio::test]
async fn db_materializes_before_wordpress() {
    let orchestrator = Scripted::default();
    let vars = secrets();

    let records = planner::materialize(&orchestrator, &request(&vars))
        .await
        .unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].service, "db");
    assert_eq!(records[1].service, "wordpress");

    let calls = orchestrator.calls();
    let db_start = calls
        .iter()
        .position(|c| c == "start:id-blog-x7k2m9-db")
        .unwrap();
    let wp_create = calls
        .iter()
        .position(|c| c == "create:blog-x7k2m9-wordpress")
        .unwrap();
    assert!(db_start < wp_create, "db must be running before wordpress is created: {calls:?}");

    assert!(calls.contains(&"create-network:hoster-dep-1".to_string()));
    assert!(calls.contains(&"create-volume:hoster-dep-1-db-data".to_string()));
}

#[tokio::test]
async fn rerun_reuses_existing_containers() {
    let mut preexisting = Vec::new();
    for service in ["db", "wordpress"] {
        let mut labels = BTreeMap::new();
        labels.insert("deployment_id".to_string(), "dep-1".to_string());
        labels.insert("service".to_string(), service.to_string());
        preexisting.push(ContainerInfo {
            id: format!("old-{service}"),
            name: format!("blog-x7k2m9-{service}"),
            image: String::new(),
            state: ContainerState::Exited,
            health: HealthState::None,
            labels,
            ports: Vec::new(),
            started_at: None,
            exit_code: Some(0),
        });
    }
    let orchestrator = Scripted {
        preexisting,
        ..Default::default()
    };
    let vars = secrets();

    let records = planner::materialize(&orchestrator, &request(&vars))
        .await
        .unwrap();

    // Same container ids as before: restart reuses, never recreates.
    assert_eq!(records[0].id, "old-db");
    assert_eq!(records[1].id, "old-wordpress");
    let calls = orchestrator.calls();
    assert!(!calls.iter().any(|c| c.starts_with("create:")), "{calls:?}");
    assert!(calls.contains(&"start:old-db".to_string()));
}

#[tokio::test]
async fn failure_rolls_back_created_containers_but_keeps_volumes() {
    let orchestrator = Scripted {
        fail_create: Some(("wordpress".to_string(), "image-not-found")),
        ..Default::default()
    };
    let vars = secrets();

    let err = planner::materialize(&orchestrator, &request(&vars))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "image-not-found");

    let calls = orchestrator.calls();
    // The db container created in this run is removed, the network
    // torn down, and the volume left alone.
    assert!(calls.contains(&"remove-container:id-blog-x7k2m9-db".to_string()), "{calls:?}");
    assert!(calls.contains(&"remove-network:hoster-dep-1".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("remove-volume:")), "{calls:?}");
}

#[tokio::test]
async fn substituted_environment_reaches_the_container() {
    let orchestrator = Scripted::default();
    let vars = secrets();

    planner::materialize(&orchestrator, &request(&vars))
        .await
        .unwrap();

    // The proxy port lands on the routed service's declared port.
    let calls = orchestrator.calls();
    assert!(calls.contains(&"create:blog-x7k2m9-db".to_string()));
    assert!(calls.contains(&"pull:mysql:8.0".to_string()));
}

#[tokio::test]
async fn convergence_waits_for_health_and_fails_on_unhealthy() {
    let orchestrator = Scripted::default();
    orchestrator.health.lock().unwrap().insert(
        "c1".to_string(),
        vec![
            (ContainerState::Running, HealthState::Starting),
            (ContainerState::Running, HealthState::Healthy),
        ],
    );

    planner::await_converged(&orchestrator, &["c1".to_string()], Duration::from_secs(30))
        .await
        .unwrap();

    orchestrator
        .health
        .lock()
        .unwrap()
        .insert("c2".to_string(), vec![(ContainerState::Running, HealthState::Unhealthy)]);
    let err = planner::await_converged(&orchestrator, &["c2".to_string()], Duration::from_secs(30))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not-running");
}

#[tokio::test]
async fn convergence_times_out_while_pending() {
    let orchestrator = Scripted::default();
    orchestrator.health.lock().unwrap().insert(
        "c1".to_string(),
        vec![(ContainerState::Created, HealthState::None)],
    );

    let err = planner::await_converged(&orchestrator, &["c1".to_string()], Duration::from_secs(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn exited_container_fails_convergence_immediately() {
    let orchestrator = Scripted::default();
    orchestrator.health.lock().unwrap().insert(
        "c1".to_string(),
        vec![(ContainerState::Exited, HealthState::None)],
    );

    let err = planner::await_converged(&orchestrator, &["c1".to_string()], Duration::from_secs(30))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not-running");
}
