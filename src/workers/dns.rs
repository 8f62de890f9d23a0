use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::proto::rr::{RData, RecordType};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::run_ticker;
use crate::error::{HosterError, HosterResult};
use crate::store::Engine;
use crate::store::db::ListFilter;
use crate::store::entities::{self, DEPLOYMENTS, DomainEntry, DomainKind};

pub const INTERVAL: Duration = Duration::from_secs(120);

/// Verifies customer-supplied custom domains: the domain's CNAME must
/// point at the deployment's generated hostname before the proxy will
/// be asked to serve it as verified.
pub struct DnsVerifier {
    engine: Arc<Engine>,
    resolver: TokioAsyncResolver,
}

impl DnsVerifier {
    pub fn new(engine: Arc<Engine>) -> HosterResult<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| HosterError::Configuration(format!("dns resolver: {e}")))?;
        Ok(Self { engine, resolver })
    }

    pub async fn run(self, cancel: CancellationToken) {
        run_ticker("dns-verifier", INTERVAL, cancel, || self.tick()).await;
    }

    async fn tick(&self) -> HosterResult<()> {
        let deployments = self
            .engine
            .system_list(DEPLOYMENTS, &ListFilter::default())
            .await?;

        for deployment in deployments.iter().filter(|d| d.status != "deleted") {
            let mut domains: Vec<DomainEntry> = entities::attr_as(deployment, "domains")?;
            let Some(target) = domains
                .iter()
                .find(|d| d.kind == DomainKind::Auto)
                .map(|d| d.hostname.clone())
            else {
                continue;
            };

            let mut changed = false;
            for domain in domains
                .iter_mut()
                .filter(|d| d.kind == DomainKind::Custom && !d.verified)
            {
                if self.cname_matches(&domain.hostname, &target).await {
                    info!(
                        deployment = %deployment.id,
                        hostname = %domain.hostname,
                        "custom domain verified"
                    );
                    domain.verified = true;
                    changed = true;
                }
            }

            if changed {
                self.engine
                    .system_update(
                        DEPLOYMENTS,
                        &deployment.id,
                        [("domains".to_string(), json!(domains))]
                            .into_iter()
                            .collect(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn cname_matches(&self, hostname: &str, expected: &str) -> bool {
        let lookup = match self.resolver.lookup(hostname, RecordType::CNAME).await {
            Ok(lookup) => lookup,
            Err(err) => {
                debug!(%hostname, error = %err, "cname lookup failed");
                return false;
            }
        };

        lookup.iter().any(|record| {
            if let RData::CNAME(target) = record {
                normalize(&target.0.to_utf8()) == normalize(expected)
            } else {
                false
            }
        })
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_ignores_case_and_root_dot() {
        assert_eq!(normalize("App-1.Apps.Example.COM."), "app-1.apps.example.com");
        assert_eq!(normalize("app-1.apps.example.com"), "app-1.apps.example.com");
    }
}
