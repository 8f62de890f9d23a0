pub mod deployment;
pub mod node;
pub mod provision;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::config::Config;
use crate::error::{HosterError, HosterResult};
use crate::pool::HostPool;
use crate::store::{CommandDispatch, CommandOutcome, Engine, EntityRow};
use crate::workers::billing::EventSender;

/// Collaborators handed to every command handler. Handlers run with a
/// defensive copy of the row and report back through their outcome;
/// they never mutate their own row through the engine.
#[derive(Clone)]
pub struct CommandContext {
    pub engine: Arc<Engine>,
    pub pool: Arc<HostPool>,
    pub config: Arc<Config>,
    pub events: Option<EventSender>,
}

impl CommandContext {
    pub(crate) fn emit(&self, user: &str, event_type: &str, resource_id: &str) {
        if let Some(events) = &self.events {
            let _ = events.send(crate::workers::billing::MeterEvent {
                user_id: user.to_string(),
                event_type: event_type.to_string(),
                resource_id: resource_id.to_string(),
                resource_type: "deployment".to_string(),
                metadata: serde_json::Value::Null,
                timestamp: chrono::Utc::now(),
            });
        }
    }
}

/// Maps command names fired by state transitions onto their handlers.
pub struct CommandBus {
    ctx: CommandContext,
}

impl CommandBus {
    #[must_use]
    pub const fn new(ctx: CommandContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl CommandDispatch for CommandBus {
    async fn dispatch(&self, command: &str, row: EntityRow) -> HosterResult<CommandOutcome> {
        debug!(command, entity_id = %row.id, status = %row.status, "dispatching command");

        match command {
            "publish" => Ok(CommandOutcome::default().update("published", json!(true))),
            "unpublish" => Ok(CommandOutcome::default().update("published", json!(false))),
            "schedule" => deployment::schedule(&self.ctx, &row).await,
            "start" => deployment::start(&self.ctx, &row).await,
            "stop" => deployment::stop(&self.ctx, &row).await,
            "restart" => deployment::restart(&self.ctx, &row).await,
            "destroy" => deployment::destroy(&self.ctx, &row).await,
            "verify-node" => node::verify(&self.ctx, &row).await,
            "provision-instance" => provision::advance(&self.ctx, &row).await,
            "destroy-instance" => provision::destroy(&self.ctx, &row).await,
            other => Err(HosterError::Internal(format!("no handler for command {other}"))),
        }
    }

    fn failure_status(&self, command: &str) -> Option<&'static str> {
        match command {
            // Deployment lifecycle failures park the row in `failed`;
            // provision steps stay on their current step with the
            // error recorded, and node probes report through their
            // outcome instead of failing.
            "schedule" | "start" | "stop" | "restart" | "destroy" => Some("failed"),
            _ => None,
        }
    }
}
