use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::run_ticker;
use crate::error::HosterResult;
use crate::store::Engine;
use crate::store::db::ListFilter;
use crate::store::entities::NODES;

pub const INTERVAL: Duration = Duration::from_secs(60);

/// Probes every registered node through the verify command, keeping
/// `status`, capacity counters, and `last_health_check` current.
/// Offline is sticky until a probe succeeds again; maintenance nodes
/// are left alone.
pub struct HealthChecker {
    engine: Arc<Engine>,
}

impl HealthChecker {
    #[must_use]
    pub const fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn run(self, cancel: CancellationToken) {
        run_ticker("health-checker", INTERVAL, cancel, || self.tick()).await;
    }

    async fn tick(&self) -> HosterResult<()> {
        let nodes = self
            .engine
            .system_list(NODES, &ListFilter::default())
            .await?;

        for node in nodes
            .iter()
            .filter(|n| n.status == "online" || n.status == "offline")
        {
            if let Err(err) = self
                .engine
                .system_run_command(NODES, &node.id, "verify-node")
                .await
            {
                debug!(node = %node.id, error = %err, "health probe errored");
            }
        }
        Ok(())
    }
}
