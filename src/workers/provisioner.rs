use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::run_ticker;
use crate::error::HosterResult;
use crate::store::Engine;
use crate::store::db::ListFilter;
use crate::store::entities::CLOUD_PROVISIONS;

pub const INTERVAL: Duration = Duration::from_secs(15);

/// Advances every in-flight cloud provision by one step per tick.
/// A step that fails records its error on the row and is retried on
/// the next tick.
pub struct Provisioner {
    engine: Arc<Engine>,
}

impl Provisioner {
    #[must_use]
    pub const fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn run(self, cancel: CancellationToken) {
        run_ticker("provisioner", INTERVAL, cancel, || self.tick()).await;
    }

    async fn tick(&self) -> HosterResult<()> {
        for status in ["pending", "creating", "configuring"] {
            let rows = self
                .engine
                .system_list(
                    CLOUD_PROVISIONS,
                    &ListFilter {
                        status: Some(status.to_string()),
                        ..Default::default()
                    },
                )
                .await?;

            for row in rows {
                if let Err(err) = self
                    .engine
                    .system_run_command(CLOUD_PROVISIONS, &row.id, "provision-instance")
                    .await
                {
                    // Recorded on the row; next tick retries the step.
                    debug!(provision = %row.id, error = %err, "provision step failed");
                }
            }
        }
        Ok(())
    }
}
