use serde_json::{Value, json};
use tracing::info;

use super::CommandContext;
use crate::error::{HosterError, HosterResult};
use crate::providers::{self, InstanceRequest};
use crate::store::entities::{NODES, SSH_KEYS};
use crate::store::{CommandOutcome, EntityRow};

/// Advance a cloud provision one step along
/// `pending -> creating -> configuring -> ready`.
///
/// Called once per provisioner tick. Errors leave the row on its
/// current step with the error recorded; the next tick retries the
/// same step.
pub async fn advance(ctx: &CommandContext, row: &EntityRow) -> HosterResult<CommandOutcome> {
    let adapter = adapter_for(ctx, row)?;

    match row.status.as_str() {
        "pending" => {
            let fingerprint = ssh_key_fingerprint(ctx, row).await?;
            let instance_id = adapter
                .create_instance(&InstanceRequest {
                    name: required(row, "instance_name")?,
                    region: required(row, "region")?,
                    size: required(row, "size")?,
                    ssh_key_fingerprint: fingerprint,
                })
                .await?;

            info!(provision = %row.id, %instance_id, "cloud instance requested");
            Ok(CommandOutcome::to_status("creating")
                .update("provider_instance_id", json!(instance_id))
                .update("current_step", json!("creating"))
                .update("error_message", Value::Null))
        }
        "creating" => {
            let instance_id = required(row, "provider_instance_id")?;
            let state = adapter
                .get_instance(&instance_id)
                .await?
                .ok_or_else(|| HosterError::NotFound(format!("instance {instance_id}")))?;

            match state.public_ip {
                // Still booting; stay on this step.
                None => Ok(CommandOutcome::default()),
                Some(ip) => Ok(CommandOutcome::to_status("configuring")
                    .update("public_ip", json!(ip))
                    .update("current_step", json!("configuring"))),
            }
        }
        "configuring" => {
            let ip = required(row, "public_ip")?;
            let node = ctx
                .engine
                .system_create(
                    NODES,
                    &row.owner_id,
                    serde_json::Map::from_iter([
                        ("name".to_string(), json!(required(row, "instance_name")?)),
                        ("ssh_host".to_string(), json!(ip)),
                        (
                            "ssh_key_id".to_string(),
                            json!(required(row, "ssh_key_id")?),
                        ),
                        ("capabilities".to_string(), json!(["docker"])),
                        ("cpu_total".to_string(), json!(1.0)),
                        ("memory_total_mb".to_string(), json!(1024)),
                        ("disk_total_mb".to_string(), json!(25600)),
                        ("provider".to_string(), json!(row.attr_str("provider"))),
                        ("provision_id".to_string(), json!(row.id)),
                    ]),
                )
                .await?;

            info!(provision = %row.id, node = %node.id, "node registered for cloud instance");
            Ok(CommandOutcome::to_status("ready")
                .update("node_id", json!(node.id))
                .update("current_step", json!("ready")))
        }
        // Nothing to do from ready or any terminal step.
        _ => Ok(CommandOutcome::default()),
    }
}

/// Tear down the cloud instance behind a provision and retire its
/// node row.
pub async fn destroy(ctx: &CommandContext, row: &EntityRow) -> HosterResult<CommandOutcome> {
    if let Some(instance_id) = row.attr_str("provider_instance_id") {
        let adapter = adapter_for(ctx, row)?;
        match adapter.destroy_instance(instance_id).await {
            Ok(()) | Err(HosterError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }

    if let Some(node_id) = row.attr_str("node_id") {
        if let Some(node) = ctx.engine.system_get(NODES, node_id).await? {
            if node.status != "deleted" {
                ctx.pool.remove(node_id).await;
                ctx.engine
                    .system_set_status(NODES, node_id, "deleted", serde_json::Map::new())
                    .await?;
            }
        }
    }

    Ok(CommandOutcome::to_status("destroyed").update("current_step", json!("destroyed")))
}

fn adapter_for(
    ctx: &CommandContext,
    row: &EntityRow,
) -> HosterResult<Box<dyn providers::CloudProvider>> {
    let provider = row
        .attr_str("provider")
        .ok_or_else(|| HosterError::BadRequest("provision has no provider".into()))?;
    let ciphertext = row
        .attr_str("encrypted_token")
        .ok_or_else(|| HosterError::Internal("provision has no credential".into()))?;
    // Plaintext credential lives only on this handler's stack.
    let token = ctx.engine.secrets().decrypt_string(ciphertext)?;
    providers::adapter_for(provider, token)
}

async fn ssh_key_fingerprint(ctx: &CommandContext, row: &EntityRow) -> HosterResult<String> {
    let key_id = required(row, "ssh_key_id")?;
    let key = ctx
        .engine
        .system_get(SSH_KEYS, &key_id)
        .await?
        .ok_or_else(|| HosterError::NotFound(format!("ssh_keys/{key_id}")))?;
    key.attr_str("fingerprint")
        .map(ToString::to_string)
        .ok_or_else(|| HosterError::Internal(format!("ssh key {key_id} has no fingerprint")))
}

fn required(row: &EntityRow, attr: &str) -> HosterResult<String> {
    row.attr_str(attr)
        .map(ToString::to_string)
        .ok_or_else(|| HosterError::BadRequest(format!("provision is missing {attr}")))
}
