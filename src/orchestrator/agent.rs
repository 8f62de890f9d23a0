use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::ssh::{SshSession, TunnelStream};
use super::{
    ContainerInfo, ContainerSpec, ContainerStats, DEFAULT_VERB_TIMEOUT, HostInfo, LogOptions,
    NetworkSpec, Orchestrator, VolumeSpec,
};
use crate::error::{HosterError, HosterResult};

/// Where the agent binary lives on every node.
pub const AGENT_REMOTE_PATH: &str = "/usr/local/bin/hoster-agent";

/// Agent protocol version; nodes running anything else get a fresh
/// upload before the first verb.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Response envelope of the agent protocol: one JSON object on
/// stdout per invocation.
#[derive(Debug, Serialize, Deserialize)]
pub struct AgentEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentErrorBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentErrorBody {
    pub code: String,
    pub command: String,
    pub message: String,
}

impl AgentEnvelope {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn fail(command: &str, err: &HosterError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(AgentErrorBody {
                code: err.kind().to_string(),
                command: command.to_string(),
                message: err.to_string(),
            }),
        }
    }
}

// Stdin parameter shapes shared between the client and the agent
// binary.

#[derive(Debug, Serialize, Deserialize)]
pub struct IdParams {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopParams {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveParams {
    pub id: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub volumes: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsParams {
    pub id: String,
    #[serde(flatten)]
    pub options: LogOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NetworkTargetParams {
    pub network: String,
    pub container: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NameParams {
    pub name: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LabelsParams {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageParams {
    pub image: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteFileParams {
    pub path: String,
    /// Base64 so binary-safe content survives the JSON envelope.
    pub content_b64: String,
    pub mode: u32,
}

/// Connection settings for one node.
#[derive(Debug, Clone)]
pub struct AgentTarget {
    pub node_id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Decrypted PEM private key.
    pub private_key: String,
}

/// Orchestrator implementation that runs every verb through the agent
/// binary on a remote node.
///
/// The underlying SSH connection is serialized behind a mutex; each
/// verb opens a fresh session channel over it. Before every verb the
/// connection is probed and re-dialed if dead. The first verb also
/// gates on the agent binary being present at [`AGENT_REMOTE_PATH`]
/// in the expected version, uploading it when absent or stale.
pub struct AgentClient {
    target: AgentTarget,
    agent_dir: PathBuf,
    session: Mutex<Option<SshSession>>,
    agent_ready: Mutex<bool>,
}

impl AgentClient {
    #[must_use]
    pub fn new(target: AgentTarget, agent_dir: PathBuf) -> Self {
        Self {
            target,
            agent_dir,
            session: Mutex::new(None),
            agent_ready: Mutex::new(false),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.target.node_id
    }

    /// Open a fresh TCP tunnel to a loopback port on the node. Used
    /// by the proxy to reach deployment ports on remote hosts.
    pub async fn open_tunnel(&self, port: u16) -> HosterResult<TunnelStream> {
        let mut slot = self.session.lock().await;
        let session = Self::ensure_session(&self.target, &mut slot).await?;
        session.open_tunnel(port).await
    }

    /// Dispatch one verb through the agent and decode its envelope.
    async fn invoke(
        &self,
        verb: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> HosterResult<Value> {
        let mut slot = self.session.lock().await;
        let session = Self::ensure_session(&self.target, &mut slot).await?;
        self.ensure_agent(session).await?;

        let stdin = params.map(|p| serde_json::to_vec(&p)).transpose()?;
        let command = format!("{AGENT_REMOTE_PATH} {verb}");
        let result = session.exec(&command, stdin.as_deref(), timeout).await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                // A timed-out or broken session is abandoned; the next
                // verb re-dials.
                if let Some(dead) = slot.take() {
                    dead.disconnect().await;
                }
                return Err(err);
            }
        };

        let envelope: AgentEnvelope =
            serde_json::from_slice(&output.stdout).map_err(|_| {
                HosterError::Internal(format!(
                    "agent returned no envelope for {verb} (exit {}): {}",
                    output.exit_code,
                    output.stderr_string()
                ))
            })?;

        if envelope.success {
            Ok(envelope.data.unwrap_or(Value::Null))
        } else {
            let body = envelope.error.ok_or_else(|| {
                HosterError::Internal(format!("agent failure for {verb} carried no error"))
            })?;
            Err(HosterError::from_kind(&body.code, &body.message))
        }
    }

    async fn ensure_session<'a>(
        target: &AgentTarget,
        slot: &'a mut Option<SshSession>,
    ) -> HosterResult<&'a SshSession> {
        let alive = match slot.as_ref() {
            Some(session) => session.keepalive().await,
            None => false,
        };

        if !alive {
            if let Some(dead) = slot.take() {
                debug!(node = %target.node_id, "ssh keepalive failed, re-dialing");
                dead.disconnect().await;
            }
            let session = SshSession::connect(
                &target.host,
                target.port,
                &target.user,
                &target.private_key,
            )
            .await?;
            *slot = Some(session);
        }

        slot.as_ref()
            .ok_or_else(|| HosterError::ConnectionFailed("ssh session lost".into()))
    }

    /// Version-gate the agent binary, uploading when absent or stale.
    /// Idempotent: a matching version never re-uploads.
    async fn ensure_agent(&self, session: &SshSession) -> HosterResult<()> {
        let mut ready = self.agent_ready.lock().await;
        if *ready {
            return Ok(());
        }

        let probe = session
            .exec(
                &format!("{AGENT_REMOTE_PATH} version"),
                None,
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;

        let current = serde_json::from_slice::<Value>(&probe.stdout)
            .ok()
            .and_then(|v| {
                v.get("version")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            });

        match current {
            Some(version) if version == AGENT_VERSION => {
                debug!(node = %self.target.node_id, %version, "agent up to date");
            }
            current => {
                info!(
                    node = %self.target.node_id,
                    found = current.as_deref().unwrap_or("none"),
                    want = AGENT_VERSION,
                    "deploying agent binary"
                );
                self.upload_agent(session).await?;
            }
        }

        *ready = true;
        Ok(())
    }

    async fn upload_agent(&self, session: &SshSession) -> HosterResult<()> {
        let arch_probe = session.exec("uname -m", None, DEFAULT_VERB_TIMEOUT).await?;
        let arch = match arch_probe.stdout_string().as_str() {
            "x86_64" | "amd64" => "amd64",
            "aarch64" | "arm64" => "arm64",
            other => {
                return Err(HosterError::Configuration(format!(
                    "node {} has unsupported architecture {other}",
                    self.target.node_id
                )));
            }
        };

        let binary = self.agent_binary(arch).await?;
        let upload = session
            .exec(
                &format!("cat > {AGENT_REMOTE_PATH} && chmod +x {AGENT_REMOTE_PATH}"),
                Some(&binary[..]),
                Duration::from_secs(120),
            )
            .await?;

        if upload.exit_code != 0 {
            return Err(HosterError::Internal(format!(
                "agent upload to {} failed: {}",
                self.target.node_id,
                upload.stderr_string()
            )));
        }
        Ok(())
    }

    /// Agent binary bytes for a platform: compiled in when the
    /// `embed-agent` feature is on, loaded from the agent directory
    /// otherwise.
    async fn agent_binary(&self, arch: &str) -> HosterResult<Vec<u8>> {
        #[cfg(feature = "embed-agent")]
        {
            match arch {
                "amd64" => {
                    return Ok(
                        include_bytes!("../../agents/hoster-agent-linux-amd64").to_vec()
                    );
                }
                "arm64" => {
                    return Ok(
                        include_bytes!("../../agents/hoster-agent-linux-arm64").to_vec()
                    );
                }
                _ => {}
            }
        }

        let path = self.agent_dir.join(format!("hoster-agent-linux-{arch}"));
        tokio::fs::read(&path).await.map_err(|_| {
            HosterError::Configuration(format!(
                "agent binary missing at {}",
                path.display()
            ))
        })
    }
}

#[async_trait]
impl Orchestrator for AgentClient {
    async fn ping(&self) -> HosterResult<()> {
        self.invoke("ping", None, DEFAULT_VERB_TIMEOUT).await?;
        Ok(())
    }

    async fn host_info(&self) -> HosterResult<HostInfo> {
        let data = self.invoke("info", None, DEFAULT_VERB_TIMEOUT).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> HosterResult<String> {
        let data = self
            .invoke(
                "create-container",
                Some(serde_json::to_value(spec)?),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        id_from(&data)
    }

    async fn start_container(&self, id: &str) -> HosterResult<()> {
        self.invoke(
            "start-container",
            Some(json!(IdParams { id: id.into() })),
            DEFAULT_VERB_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, graceful: Option<Duration>) -> HosterResult<()> {
        // Leave the verb headroom past the in-container grace period.
        let timeout = DEFAULT_VERB_TIMEOUT + graceful.unwrap_or_default();
        self.invoke(
            "stop-container",
            Some(json!(StopParams {
                id: id.into(),
                graceful_secs: graceful.map(|d| d.as_secs()),
            })),
            timeout,
        )
        .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> HosterResult<()> {
        self.invoke(
            "remove-container",
            Some(json!(RemoveParams {
                id: id.into(),
                force,
                volumes,
            })),
            DEFAULT_VERB_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> HosterResult<ContainerInfo> {
        let data = self
            .invoke(
                "inspect-container",
                Some(json!(IdParams { id: id.into() })),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn list_containers(
        &self,
        all: bool,
        labels: &BTreeMap<String, String>,
    ) -> HosterResult<Vec<ContainerInfo>> {
        let data = self
            .invoke(
                "list-containers",
                Some(json!(ListParams {
                    all,
                    labels: labels.clone(),
                })),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn container_logs(&self, id: &str, options: &LogOptions) -> HosterResult<String> {
        let data = self
            .invoke(
                "container-logs",
                Some(json!(LogsParams {
                    id: id.into(),
                    options: options.clone(),
                })),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        Ok(data
            .get("logs")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    async fn container_stats(&self, id: &str) -> HosterResult<ContainerStats> {
        let data = self
            .invoke(
                "container-stats",
                Some(json!(IdParams { id: id.into() })),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> HosterResult<String> {
        let data = self
            .invoke(
                "create-network",
                Some(serde_json::to_value(spec)?),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        id_from(&data)
    }

    async fn remove_network(&self, name: &str) -> HosterResult<()> {
        self.invoke(
            "remove-network",
            Some(json!(NameParams {
                name: name.into(),
                force: false,
            })),
            DEFAULT_VERB_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn connect_network(&self, network: &str, container: &str) -> HosterResult<()> {
        self.invoke(
            "connect-network",
            Some(json!(NetworkTargetParams {
                network: network.into(),
                container: container.into(),
            })),
            DEFAULT_VERB_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> HosterResult<()> {
        self.invoke(
            "disconnect-network",
            Some(json!(NetworkTargetParams {
                network: network.into(),
                container: container.into(),
            })),
            DEFAULT_VERB_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> HosterResult<String> {
        let data = self
            .invoke(
                "create-volume",
                Some(serde_json::to_value(spec)?),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        id_from(&data)
    }

    async fn remove_volume(&self, name: &str, force: bool) -> HosterResult<()> {
        self.invoke(
            "remove-volume",
            Some(json!(NameParams {
                name: name.into(),
                force,
            })),
            DEFAULT_VERB_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn list_volumes(&self, labels: &BTreeMap<String, String>) -> HosterResult<Vec<String>> {
        let data = self
            .invoke(
                "list-volumes",
                Some(json!(LabelsParams {
                    labels: labels.clone(),
                })),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn pull_image(&self, image: &str) -> HosterResult<()> {
        self.invoke(
            "pull-image",
            Some(json!(ImageParams {
                image: image.into(),
            })),
            // Pulls move image layers; give them real time.
            Duration::from_secs(300),
        )
        .await?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> HosterResult<bool> {
        let data = self
            .invoke(
                "image-exists",
                Some(json!(ImageParams {
                    image: image.into(),
                })),
                DEFAULT_VERB_TIMEOUT,
            )
            .await?;
        Ok(data
            .get("exists")
            .and_then(Value::as_bool)
            .unwrap_or_default())
    }

    async fn write_file(&self, path: &str, content: &[u8], mode: u32) -> HosterResult<()> {
        use base64::Engine as _;
        self.invoke(
            "write-file",
            Some(json!(WriteFileParams {
                path: path.into(),
                content_b64: base64::engine::general_purpose::STANDARD.encode(content),
                mode,
            })),
            DEFAULT_VERB_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn close(&self) -> HosterResult<()> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.disconnect().await;
        }
        Ok(())
    }
}

fn id_from(data: &Value) -> HosterResult<String> {
    data.get("id")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| {
            warn!(?data, "agent response missing id");
            HosterError::Internal("agent response missing id".into())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_round_trip() {
        let envelope = AgentEnvelope::ok(json!({"id": "abc123"}));
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: AgentEnvelope = serde_json::from_str(&encoded).unwrap();

        assert!(decoded.success);
        assert_eq!(decoded.data.unwrap()["id"], "abc123");
        assert!(decoded.error.is_none());
    }

    #[test]
    fn envelope_failure_carries_taxonomy_code() {
        let err = HosterError::ImageNotFound("nginx:missing".into());
        let envelope = AgentEnvelope::fail("pull-image", &err);
        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: AgentEnvelope = serde_json::from_str(&encoded).unwrap();

        let body = decoded.error.unwrap();
        assert_eq!(body.code, "image-not-found");
        assert_eq!(body.command, "pull-image");

        let rebuilt = HosterError::from_kind(&body.code, &body.message);
        assert_eq!(rebuilt.kind(), "image-not-found");
    }

    #[test]
    fn logs_params_flatten_options() {
        let params = LogsParams {
            id: "c1".into(),
            options: LogOptions {
                tail: Some(50),
                timestamps: true,
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["id"], "c1");
        assert_eq!(value["tail"], 50);
        assert_eq!(value["timestamps"], true);
    }
}
