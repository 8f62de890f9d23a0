pub mod digitalocean;

use async_trait::async_trait;

use crate::error::{HosterError, HosterResult};

/// Request to create one cloud instance.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub name: String,
    pub region: String,
    pub size: String,
    pub ssh_key_fingerprint: String,
}

/// Observed state of a cloud instance.
#[derive(Debug, Clone)]
pub struct InstanceState {
    pub id: String,
    pub status: String,
    pub public_ip: Option<String>,
}

/// A cloud provider turns credentials into reachable hosts. Each call
/// is one remote operation; the provisioner worker drives the state
/// machine around them.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create an instance and return the provider's id for it.
    async fn create_instance(&self, request: &InstanceRequest) -> HosterResult<String>;

    /// Fetch an instance's state; `None` when the provider no longer
    /// knows the id.
    async fn get_instance(&self, id: &str) -> HosterResult<Option<InstanceState>>;

    async fn destroy_instance(&self, id: &str) -> HosterResult<()>;
}

/// Adapter lookup by provider tag.
pub fn adapter_for(provider: &str, token: String) -> HosterResult<Box<dyn CloudProvider>> {
    match provider {
        "digitalocean" => Ok(Box::new(digitalocean::DigitalOcean::new(token))),
        other => Err(HosterError::BadRequest(format!(
            "unsupported cloud provider {other}"
        ))),
    }
}
