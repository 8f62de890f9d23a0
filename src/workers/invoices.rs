use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Months, NaiveDate, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::run_ticker;
use crate::error::HosterResult;
use crate::store::db::ListFilter;
use crate::store::entities::{DEPLOYMENTS, INVOICES, TEMPLATES};
use crate::store::{Engine, EntityRow};

pub const INTERVAL: Duration = Duration::from_secs(3600);

/// Writes one draft invoice per customer per billing period,
/// aggregating the monthly price of each non-deleted deployment.
/// Idempotent: a period that already has an invoice is skipped.
pub struct InvoiceGenerator {
    engine: Arc<Engine>,
}

impl InvoiceGenerator {
    #[must_use]
    pub const fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn run(self, cancel: CancellationToken) {
        run_ticker("invoice-generator", INTERVAL, cancel, || self.tick()).await;
    }

    async fn tick(&self) -> HosterResult<()> {
        let today = Utc::now().date_naive();
        let (period_start, period_end) = billing_period(today);

        let deployments = self
            .engine
            .system_list(DEPLOYMENTS, &ListFilter::default())
            .await?;

        let mut by_customer: BTreeMap<&str, Vec<&EntityRow>> = BTreeMap::new();
        for deployment in deployments.iter().filter(|d| d.status != "deleted") {
            by_customer
                .entry(deployment.owner_id.as_str())
                .or_default()
                .push(deployment);
        }

        for (customer, rows) in by_customer {
            let existing = self
                .engine
                .system_list(
                    INVOICES,
                    &ListFilter {
                        owner: Some(customer.to_string()),
                        attr_equals: vec![("period_start".into(), period_start.clone())],
                        ..Default::default()
                    },
                )
                .await?;
            if !existing.is_empty() {
                continue;
            }

            let mut line_items = Vec::new();
            let mut total: i64 = 0;
            for deployment in rows {
                let price = self.monthly_price(deployment).await?;
                total += price;
                line_items.push(json!({
                    "deployment_id": deployment.id,
                    "description": deployment.attr_str("name").unwrap_or(&deployment.id),
                    "amount_cents": price,
                }));
            }

            let invoice = self
                .engine
                .system_create(
                    INVOICES,
                    customer,
                    serde_json::Map::from_iter([
                        ("period_start".to_string(), json!(period_start)),
                        ("period_end".to_string(), json!(period_end)),
                        ("line_items".to_string(), json!(line_items)),
                        ("total_cents".to_string(), json!(total)),
                    ]),
                )
                .await?;
            info!(customer, invoice = %invoice.id, total_cents = total, "draft invoice written");
        }
        Ok(())
    }

    async fn monthly_price(&self, deployment: &EntityRow) -> HosterResult<i64> {
        let Some(template_id) = deployment.attr_str("template_id") else {
            return Ok(0);
        };
        let template = self.engine.system_get(TEMPLATES, template_id).await?;
        Ok(template
            .and_then(|t| t.attr_i64("price_cents"))
            .unwrap_or(0))
    }
}

/// Current calendar-month billing period as `YYYY-MM-DD` bounds.
fn billing_period(today: NaiveDate) -> (String, String) {
    let start = today
        .with_day(1)
        .unwrap_or(today);
    let end = start
        .checked_add_months(Months::new(1))
        .map_or_else(|| start.to_string(), |d| d.to_string());
    (start.to_string(), end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_spans_the_calendar_month() {
        let (start, end) = billing_period(NaiveDate::from_ymd_opt(2025, 3, 17).unwrap());
        assert_eq!(start, "2025-03-01");
        assert_eq!(end, "2025-04-01");
    }

    #[test]
    fn december_rolls_into_january() {
        let (start, end) = billing_period(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap());
        assert_eq!(start, "2025-12-01");
        assert_eq!(end, "2026-01-01");
    }
}
