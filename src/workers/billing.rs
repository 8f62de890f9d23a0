use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::HosterResult;

const MAX_BATCH: usize = 100;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// One metered usage event for the upstream billing gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterEvent {
    pub user_id: String,
    pub event_type: String,
    pub resource_id: String,
    pub resource_type: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

pub type EventSender = mpsc::UnboundedSender<MeterEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<MeterEvent>;

#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Drains the internal event channel and posts batches to the meter
/// endpoint.
///
/// Delivery is at-most-once per event on success and at-least-once on
/// retry: a failed POST keeps the batch and retries until the
/// transport recovers or shutdown wins.
pub struct BillingReporter {
    client: reqwest::Client,
    config: Arc<Config>,
    receiver: EventReceiver,
}

impl BillingReporter {
    #[must_use]
    pub fn new(config: Arc<Config>, receiver: EventReceiver) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            receiver,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = self.receiver.recv() => {
                    let Some(event) = event else { break };
                    let mut batch = vec![event];
                    while batch.len() < MAX_BATCH {
                        match self.receiver.try_recv() {
                            Ok(more) => batch.push(more),
                            Err(_) => break,
                        }
                    }
                    self.deliver(&batch, &cancel).await;
                }
            }
        }
    }

    async fn deliver(&self, batch: &[MeterEvent], cancel: &CancellationToken) {
        loop {
            match self.post(batch).await {
                Ok(()) => {
                    debug!(events = batch.len(), "meter batch delivered");
                    return;
                }
                Err(err) => {
                    warn!(events = batch.len(), error = %err, "meter delivery failed, retrying");
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(RETRY_DELAY) => {}
            }
        }
    }

    async fn post(&self, batch: &[MeterEvent]) -> HosterResult<()> {
        let url = format!(
            "{}{}",
            self.config.billing_url, self.config.billing_meter_path
        );
        self.client
            .post(url)
            .header("X-API-Key", &self.config.billing_api_key)
            .json(batch)
            .send()
            .await?
            .error_for_status()
            .map_err(crate::error::HosterError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_flat_fields() {
        let event = MeterEvent {
            user_id: "cust-1".into(),
            event_type: "deployment_started".into(),
            resource_id: "dep-1".into(),
            resource_type: "deployment".into(),
            metadata: Value::Null,
            timestamp: Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["user_id"], "cust-1");
        assert_eq!(value["event_type"], "deployment_started");
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (tx, mut rx) = event_channel();
        for kind in ["deployment_created", "deployment_started"] {
            tx.send(MeterEvent {
                user_id: "u".into(),
                event_type: kind.into(),
                resource_id: "d".into(),
                resource_type: "deployment".into(),
                metadata: Value::Null,
                timestamp: Utc::now(),
            })
            .unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().event_type, "deployment_created");
        assert_eq!(rx.recv().await.unwrap().event_type, "deployment_started");
    }
}
