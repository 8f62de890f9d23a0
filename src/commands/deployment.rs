use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::CommandContext;
use crate::error::{HosterError, HosterResult};
use crate::planner::{self, LABEL_DEPLOYMENT, PlanRequest};
use crate::store::db::ListFilter;
use crate::store::entities::{
    self, ContainerRecord, DEPLOYMENTS, DomainEntry, DomainKind, NODES, ResourceNeed, TEMPLATES,
    VariableDef,
};
use crate::store::{CommandOutcome, EntityRow};

const STOP_GRACE: Duration = Duration::from_secs(10);
const START_DEADLINE: Duration = Duration::from_secs(180);

/// Pick a node for a fresh deployment, allocate its proxy port and
/// hostname, and advance to `starting`.
///
/// Candidates are the template creator's online nodes whose
/// capability set covers the template's and whose free capacity fits
/// its resource need. Scoring favours the emptiest node, weighted
/// toward memory; ties fall to the lowest node id.
pub async fn schedule(ctx: &CommandContext, row: &EntityRow) -> HosterResult<CommandOutcome> {
    let template = load_template(ctx, row).await?;
    let need: ResourceNeed = entities::attr_as(&template, "resources")?;
    let required: Vec<String> = entities::attr_as(&template, "capabilities")?;

    let nodes = ctx
        .engine
        .system_list(
            NODES,
            &ListFilter {
                owner: Some(template.owner_id.clone()),
                status: Some("online".into()),
                ..Default::default()
            },
        )
        .await?;

    let mut best: Option<(f64, EntityRow)> = None;
    for node in nodes {
        let capabilities: Vec<String> = entities::attr_as(&node, "capabilities")?;
        if !required.iter().all(|cap| capabilities.contains(cap)) {
            continue;
        }

        let total_cpu = node.attr_f64("cpu_total").unwrap_or_default();
        let total_mem = node.attr_f64("memory_total_mb").unwrap_or_default();
        let total_disk = node.attr_f64("disk_total_mb").unwrap_or_default();
        let avail_cpu = total_cpu - node.attr_f64("cpu_used").unwrap_or_default();
        let avail_mem = total_mem - node.attr_f64("memory_used_mb").unwrap_or_default();
        let avail_disk = total_disk - node.attr_f64("disk_used_mb").unwrap_or_default();

        if avail_cpu < need.cpu_cores
            || avail_mem < need.memory_mb as f64
            || avail_disk < need.disk_mb as f64
        {
            continue;
        }

        let score = 0.3 * ratio(avail_cpu, total_cpu)
            + 0.4 * ratio(avail_mem, total_mem)
            + 0.3 * ratio(avail_disk, total_disk);

        // Rows arrive in id order; strictly-greater keeps the lowest
        // id on ties.
        if best.as_ref().is_none_or(|(top, _)| score > *top) {
            best = Some((score, node));
        }
    }

    let (_, node) = best.ok_or_else(|| {
        HosterError::NotFound("no online node matches the template's capabilities and capacity".into())
    })?;

    let proxy_port = allocate_port(ctx, &node.id).await?;

    let base_domain = node
        .attr_str("base_domain")
        .filter(|d| !d.is_empty())
        .unwrap_or(&ctx.config.proxy_base_domain)
        .to_string();
    let hostname = format!(
        "{}.{base_domain}",
        row.attr_str("name").unwrap_or(&row.id)
    );

    info!(
        deployment = %row.id,
        node = %node.id,
        proxy_port,
        %hostname,
        "deployment scheduled"
    );

    Ok(CommandOutcome::to_status("starting")
        .update("node_id", json!(node.id))
        .update("proxy_port", json!(proxy_port))
        .update(
            "domains",
            json!([DomainEntry {
                hostname,
                kind: DomainKind::Auto,
                ssl: false,
                verified: true,
            }]),
        ))
}

/// Materialize the deployment on its node and wait for health.
pub async fn start(ctx: &CommandContext, row: &EntityRow) -> HosterResult<CommandOutcome> {
    let node = load_node(ctx, row).await?;
    if node.status != "online" {
        return Err(HosterError::ConnectionFailed(format!(
            "node {} is {}",
            node.id, node.status
        )));
    }
    let template = load_template(ctx, row).await?;

    let variables = variable_map(row);
    let defs: Vec<VariableDef> = entities::attr_as(&template, "variables")?;
    for def in defs.iter().filter(|d| d.required) {
        if !variables.contains_key(&def.name) {
            return Err(HosterError::BadRequest(format!(
                "required variable {} is not set",
                def.name
            )));
        }
    }

    let proxy_port = row
        .attr_i64("proxy_port")
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| HosterError::Internal("deployment has no proxy port".into()))?;

    let composition = template
        .attr_str("composition")
        .ok_or_else(|| HosterError::Internal("template has no composition".into()))?;
    let config_files: Vec<entities::ConfigFile> = entities::attr_as(&template, "config_files")?;
    let routed_port = template
        .attr_i64("routed_port")
        .and_then(|p| u16::try_from(p).ok());

    let orchestrator = ctx.pool.orchestrator(&node).await?;
    let request = PlanRequest {
        deployment_id: &row.id,
        deployment_name: row.attr_str("name").unwrap_or(&row.id),
        composition,
        variables: &variables,
        proxy_port,
        routed_port,
        config_files: &config_files,
        config_dir: ctx.config.deployment_config_dir(&row.id),
    };

    let records = planner::materialize(orchestrator.as_ref(), &request).await?;
    let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
    planner::await_converged(orchestrator.as_ref(), &ids, START_DEADLINE).await?;

    ctx.emit(&row.owner_id, "deployment_started", &row.id);

    Ok(CommandOutcome::to_status("running")
        .update("containers", json!(records))
        .update("started_at", json!(Utc::now().to_rfc3339()))
        .update("error_message", Value::Null))
}

/// Stop every running container, retaining network and volumes so a
/// later start can reuse them.
pub async fn stop(ctx: &CommandContext, row: &EntityRow) -> HosterResult<CommandOutcome> {
    stop_containers(ctx, row).await?;
    ctx.emit(&row.owner_id, "deployment_stopped", &row.id);

    Ok(CommandOutcome::to_status("stopped")
        .update("stopped_at", json!(Utc::now().to_rfc3339()))
        .update("containers", json!(stopped_records(row))))
}

/// Stop, then restart through the regular start path on the same node
/// with the same proxy port and hostname.
pub async fn restart(ctx: &CommandContext, row: &EntityRow) -> HosterResult<CommandOutcome> {
    stop_containers(ctx, row).await?;

    Ok(CommandOutcome {
        status: Some("stopped".into()),
        then: Some("starting".into()),
        updates: [
            ("stopped_at".to_string(), json!(Utc::now().to_rfc3339())),
            ("containers".to_string(), json!(stopped_records(row))),
        ]
        .into_iter()
        .collect(),
    })
}

/// Tear the deployment down: containers, network, labeled volumes
/// (best-effort), and the proxy port reservation.
pub async fn destroy(ctx: &CommandContext, row: &EntityRow) -> HosterResult<CommandOutcome> {
    let cleaned = CommandOutcome::to_status("deleted")
        .update("containers", json!([]))
        .update("proxy_port", Value::Null);

    let Some(node_id) = row.attr_str("node_id") else {
        return Ok(cleaned);
    };
    let node = match ctx.engine.system_get(NODES, node_id).await? {
        Some(node) if node.status != "deleted" => node,
        // The node is gone; there is nothing left to clean up.
        _ => return Ok(cleaned),
    };

    let orchestrator = ctx.pool.orchestrator(&node).await?;
    let labels = deployment_labels(&row.id);

    for container in orchestrator.list_containers(true, &labels).await? {
        match orchestrator
            .stop_container(&container.id, Some(STOP_GRACE))
            .await
        {
            Ok(()) | Err(HosterError::NotRunning(_) | HosterError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        match orchestrator.remove_container(&container.id, true, false).await {
            Ok(()) | Err(HosterError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }

    match orchestrator
        .remove_network(&planner::network_name(&row.id))
        .await
    {
        Ok(()) | Err(HosterError::NotFound(_)) => {}
        Err(err) => return Err(err),
    }

    // Volumes carry the deployment label exactly so they can be found
    // here; losing one is logged, not fatal.
    match orchestrator.list_volumes(&labels).await {
        Ok(volumes) => {
            for volume in volumes {
                if let Err(err) = orchestrator.remove_volume(&volume, true).await {
                    warn!(deployment = %row.id, %volume, error = %err, "volume cleanup failed");
                }
            }
        }
        Err(err) => {
            warn!(deployment = %row.id, error = %err, "volume enumeration failed");
        }
    }

    Ok(cleaned)
}

async fn stop_containers(ctx: &CommandContext, row: &EntityRow) -> HosterResult<()> {
    let node = load_node(ctx, row).await?;
    let orchestrator = ctx.pool.orchestrator(&node).await?;

    for container in orchestrator
        .list_containers(true, &deployment_labels(&row.id))
        .await?
    {
        match orchestrator
            .stop_container(&container.id, Some(STOP_GRACE))
            .await
        {
            Ok(()) | Err(HosterError::NotRunning(_) | HosterError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

async fn load_template(ctx: &CommandContext, row: &EntityRow) -> HosterResult<EntityRow> {
    let template_id = row
        .attr_str("template_id")
        .ok_or_else(|| HosterError::Internal("deployment has no template".into()))?;
    ctx.engine
        .system_get(TEMPLATES, template_id)
        .await?
        .ok_or_else(|| HosterError::NotFound(format!("templates/{template_id}")))
}

async fn load_node(ctx: &CommandContext, row: &EntityRow) -> HosterResult<EntityRow> {
    let node_id = row
        .attr_str("node_id")
        .ok_or_else(|| HosterError::BadRequest("deployment has not been scheduled".into()))?;
    ctx.engine
        .system_get(NODES, node_id)
        .await?
        .filter(|n| n.status != "deleted")
        .ok_or_else(|| HosterError::NotFound(format!("nodes/{node_id}")))
}

/// First free port in the configured range, scanning ports already
/// assigned to non-deleted deployments on the node.
async fn allocate_port(ctx: &CommandContext, node_id: &str) -> HosterResult<u16> {
    let siblings = ctx
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

    let taken: std::collections::HashSet<u16> = siblings
        .iter()
        .filter(|d| d.status != "deleted")
        .filter_map(|d| d.attr_i64("proxy_port"))
        .filter_map(|p| u16::try_from(p).ok())
        .collect();

    ctx.config
        .deploy_port_range
        .clone()
        .find(|port| !taken.contains(port))
        .ok_or_else(|| {
            HosterError::LimitExceeded(format!("proxy port range exhausted on node {node_id}"))
        })
}

fn variable_map(row: &EntityRow) -> BTreeMap<String, String> {
    row.attributes
        .get("variables")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn stopped_records(row: &EntityRow) -> Vec<ContainerRecord> {
    let mut records: Vec<ContainerRecord> = entities::attr_as(row, "containers").unwrap_or_default();
    for record in &mut records {
        record.status = "stopped".to_string();
    }
    records
}

fn deployment_labels(deployment_id: &str) -> BTreeMap<String, String> {
    [(LABEL_DEPLOYMENT.to_string(), deployment_id.to_string())]
        .into_iter()
        .collect()
}

fn ratio(available: f64, total: f64) -> f64 {
    if total > 0.0 { available / total } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_guards_zero_capacity() {
        assert!((ratio(2.0, 4.0) - 0.5).abs() < f64::EPSILON);
        assert!((ratio(1.0, 0.0)).abs() < f64::EPSILON);
    }
}
