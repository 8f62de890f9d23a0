//! The node-side agent binary.
//!
//! Placed on every registered host at a known path by the server,
//! which invokes it once per container operation over SSH:
//! `hoster-agent <verb>` with JSON parameters on stdin and a JSON
//! envelope on stdout. The agent talks to the host's local Docker
//! daemon; it holds no state between invocations.

use std::time::Duration;

use base64::Engine as _;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;

use hoster::HosterError;
use hoster::error::HosterResult;
use hoster::orchestrator::agent::{
    AGENT_VERSION, AgentEnvelope, IdParams, ImageParams, LabelsParams, ListParams, LogsParams,
    NameParams, NetworkTargetParams, RemoveParams, StopParams, WriteFileParams,
};
use hoster::orchestrator::local::LocalDocker;
use hoster::orchestrator::{ContainerSpec, NetworkSpec, Orchestrator, VolumeSpec};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut args = std::env::args().skip(1);
    let Some(verb) = args.next() else {
        eprintln!("usage: hoster-agent <verb>");
        std::process::exit(2);
    };

    if verb == "version" {
        println!("{}", json!({ "version": AGENT_VERSION }));
        return;
    }

    let envelope = match run(&verb).await {
        Ok(data) => AgentEnvelope::ok(data),
        Err(err) => AgentEnvelope::fail(&verb, &err),
    };
    match serde_json::to_string(&envelope) {
        Ok(body) => println!("{body}"),
        Err(err) => {
            eprintln!("envelope encoding failed: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(verb: &str) -> HosterResult<Value> {
    let stdin = read_stdin().await?;

    // File writes are plain host-filesystem work; no daemon needed.
    if verb == "write-file" {
        let params: WriteFileParams = decode(&stdin)?;
        let content = base64::engine::general_purpose::STANDARD
            .decode(&params.content_b64)
            .map_err(|_| HosterError::BadRequest("content_b64 is not valid base64".into()))?;
        write_host_file(&params.path, &content, params.mode).await?;
        return Ok(json!({ "written": params.path }));
    }

    let docker = match std::env::var("DOCKER_SOCKET") {
        Ok(socket) => LocalDocker::connect_to(&socket).await?,
        Err(_) => LocalDocker::connect().await?,
    };

    match verb {
        "ping" => {
            docker.ping().await?;
            Ok(json!({ "ok": true }))
        }
        "info" => Ok(serde_json::to_value(docker.host_info().await?)?),
        "create-container" => {
            let spec: ContainerSpec = decode(&stdin)?;
            let id = docker.create_container(&spec).await?;
            Ok(json!({ "id": id }))
        }
        "start-container" => {
            let params: IdParams = decode(&stdin)?;
            docker.start_container(&params.id).await?;
            Ok(json!({ "id": params.id }))
        }
        "stop-container" => {
            let params: StopParams = decode(&stdin)?;
            docker
                .stop_container(&params.id, params.graceful_secs.map(Duration::from_secs))
                .await?;
            Ok(json!({ "id": params.id }))
        }
        "remove-container" => {
            let params: RemoveParams = decode(&stdin)?;
            docker
                .remove_container(&params.id, params.force, params.volumes)
                .await?;
            Ok(json!({ "id": params.id }))
        }
        "inspect-container" => {
            let params: IdParams = decode(&stdin)?;
            Ok(serde_json::to_value(
                docker.inspect_container(&params.id).await?,
            )?)
        }
        "list-containers" => {
            let params: ListParams = decode(&stdin)?;
            Ok(serde_json::to_value(
                docker.list_containers(params.all, &params.labels).await?,
            )?)
        }
        "container-logs" => {
            let params: LogsParams = decode(&stdin)?;
            let logs = docker.container_logs(&params.id, &params.options).await?;
            Ok(json!({ "logs": logs }))
        }
        "container-stats" => {
            let params: IdParams = decode(&stdin)?;
            Ok(serde_json::to_value(
                docker.container_stats(&params.id).await?,
            )?)
        }
        "create-network" => {
            let spec: NetworkSpec = decode(&stdin)?;
            let id = docker.create_network(&spec).await?;
            Ok(json!({ "id": id }))
        }
        "remove-network" => {
            let params: NameParams = decode(&stdin)?;
            docker.remove_network(&params.name).await?;
            Ok(json!({ "name": params.name }))
        }
        "connect-network" => {
            let params: NetworkTargetParams = decode(&stdin)?;
            docker
                .connect_network(&params.network, &params.container)
                .await?;
            Ok(json!({ "network": params.network }))
        }
        "disconnect-network" => {
            let params: NetworkTargetParams = decode(&stdin)?;
            docker
                .disconnect_network(&params.network, &params.container)
                .await?;
            Ok(json!({ "network": params.network }))
        }
        "create-volume" => {
            let spec: VolumeSpec = decode(&stdin)?;
            let name = docker.create_volume(&spec).await?;
            Ok(json!({ "id": name }))
        }
        "remove-volume" => {
            let params: NameParams = decode(&stdin)?;
            docker.remove_volume(&params.name, params.force).await?;
            Ok(json!({ "name": params.name }))
        }
        "list-volumes" => {
            let params: LabelsParams = decode(&stdin)?;
            Ok(serde_json::to_value(
                docker.list_volumes(&params.labels).await?,
            )?)
        }
        "pull-image" => {
            let params: ImageParams = decode(&stdin)?;
            docker.pull_image(&params.image).await?;
            Ok(json!({ "image": params.image }))
        }
        "image-exists" => {
            let params: ImageParams = decode(&stdin)?;
            let exists = docker.image_exists(&params.image).await?;
            Ok(json!({ "exists": exists }))
        }
        other => Err(HosterError::BadRequest(format!("unknown verb {other}"))),
    }
}

async fn read_stdin() -> HosterResult<Vec<u8>> {
    let mut buffer = Vec::new();
    tokio::io::stdin().read_to_end(&mut buffer).await?;
    Ok(buffer)
}

fn decode<T: serde::de::DeserializeOwned>(stdin: &[u8]) -> HosterResult<T> {
    serde_json::from_slice(stdin)
        .map_err(|e| HosterError::BadRequest(format!("parameters do not parse: {e}")))
}

async fn write_host_file(path: &str, content: &[u8], mode: u32) -> HosterResult<()> {
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
