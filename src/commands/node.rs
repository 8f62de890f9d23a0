use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use super::CommandContext;
use crate::error::HosterResult;
use crate::store::db::ListFilter;
use crate::store::entities::{self, DEPLOYMENTS, ResourceNeed};
use crate::store::{CommandOutcome, EntityRow};

/// Probe a node and report its observed state.
///
/// Never fails: an unreachable node resolves to `offline` with the
/// error recorded, a reachable one to `online` with refreshed
/// capacity counters. Both the on-demand verify action and the
/// periodic health checker run through here, which keeps offline
/// sticky until a probe actually succeeds.
pub async fn verify(ctx: &CommandContext, row: &EntityRow) -> HosterResult<CommandOutcome> {
    let now = json!(Utc::now().to_rfc3339());

    let probe = async {
        let orchestrator = ctx.pool.orchestrator(row).await?;
        orchestrator.ping().await?;
        orchestrator.host_info().await
    };

    match probe.await {
        Err(err) => {
            debug!(node = %row.id, error = %err, "node probe failed");
            Ok(CommandOutcome::to_status("offline")
                .update("last_health_check", now)
                .update("error_message", json!(err.to_string())))
        }
        Ok(info) => {
            let (cpu_used, memory_used, disk_used) = used_capacity(ctx, &row.id).await?;

            let mut outcome = CommandOutcome::to_status("online")
                .update("last_health_check", now)
                .update("error_message", Value::Null)
                .update("cpu_used", json!(cpu_used))
                .update("memory_used_mb", json!(memory_used))
                .update("disk_used_mb", json!(disk_used));

            // Observed totals win over declared ones when the daemon
            // reports them.
            if info.cpu_cores > 0.0 {
                outcome = outcome.update("cpu_total", json!(info.cpu_cores));
            }
            if info.memory_mb > 0 {
                outcome = outcome.update("memory_total_mb", json!(info.memory_mb));
            }
            if info.disk_mb > 0 {
                outcome = outcome.update("disk_total_mb", json!(info.disk_mb));
            }
            Ok(outcome)
        }
    }
}

/// Capacity consumed by the node's non-deleted deployments.
async fn used_capacity(ctx: &CommandContext, node_id: &str) -> HosterResult<(f64, u64, u64)> {
    let deployments = ctx
        .engine
        .system_list(
            DEPLOYMENTS,
            &ListFilter {
                attr_equals: vec![("node_id".into(), node_id.to_string())],
                limit: Some(500),
                ..Default::default()
            },
        )
        .await?;

    let mut cpu = 0.0;
    let mut memory = 0;
    let mut disk = 0;
    for deployment in deployments.iter().filter(|d| d.status != "deleted") {
        let need: ResourceNeed = entities::attr_as(deployment, "resources")?;
        cpu += need.cpu_cores;
        memory += need.memory_mb;
        disk += need.disk_mb;
    }
    Ok((cpu, memory, disk))
}
