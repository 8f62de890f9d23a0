use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{CloudProvider, InstanceRequest, InstanceState};
use crate::error::{HosterError, HosterResult};

const DEFAULT_IMAGE: &str = "ubuntu-24-04-x64";

/// `DigitalOcean` adapter over its REST API.
pub struct DigitalOcean {
    client: reqwest::Client,
    token: String,
    base_url: String,
    image: String,
}

impl DigitalOcean {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: "https://api.digitalocean.com".to_string(),
            image: DEFAULT_IMAGE.to_string(),
        }
    }

    /// Point the adapter somewhere else (tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(response: reqwest::Response, context: &str) -> HosterResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            404 => HosterError::NotFound(format!("{context}: {body}")),
            401 | 403 => HosterError::Unauthorized,
            429 => HosterError::LimitExceeded(format!("{context}: {body}")),
            _ => HosterError::Internal(format!("{context}: {status}: {body}")),
        })
    }
}

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct Droplet {
    id: u64,
    status: String,
    #[serde(default)]
    networks: Networks,
}

#[derive(Deserialize, Default)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[async_trait]
impl CloudProvider for DigitalOcean {
    async fn create_instance(&self, request: &InstanceRequest) -> HosterResult<String> {
        let response = self
            .client
            .post(self.url("/v2/droplets"))
            .bearer_auth(&self.token)
            .json(&json!({
                "name": request.name,
                "region": request.region,
                "size": request.size,
                "image": self.image,
                "ssh_keys": [request.ssh_key_fingerprint],
                "monitoring": true,
            }))
            .send()
            .await?;

        let envelope: DropletEnvelope = Self::check(response, "droplet create")
            .await?
            .json()
            .await?;
        Ok(envelope.droplet.id.to_string())
    }

    async fn get_instance(&self, id: &str) -> HosterResult<Option<InstanceState>> {
        let response = self
            .client
            .get(self.url(&format!("/v2/droplets/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let envelope: DropletEnvelope = match Self::check(response, "droplet get").await {
            Ok(response) => response.json().await?,
            Err(HosterError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let public_ip = envelope
            .droplet
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.clone());

        Ok(Some(InstanceState {
            id: envelope.droplet.id.to_string(),
            status: envelope.droplet.status,
            public_ip,
        }))
    }

    async fn destroy_instance(&self, id: &str) -> HosterResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/v2/droplets/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;

        match Self::check(response, "droplet delete").await {
            Ok(_) | Err(HosterError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn droplet_envelope_decodes() {
        let body = r#"{
            "droplet": {
                "id": 3164444,
                "status": "active",
                "networks": {
                    "v4": [
                        {"ip_address": "10.0.0.2", "type": "private"},
                        {"ip_address": "203.0.113.7", "type": "public"}
                    ]
                }
            }
        }"#;

        let envelope: DropletEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.droplet.id, 3_164_444);
        let public = envelope
            .droplet
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .unwrap();
        assert_eq!(public.ip_address, "203.0.113.7");
    }

    #[test]
    fn base_url_override_trims_slash() {
        let adapter = DigitalOcean::new("t".into()).with_base_url("http://127.0.0.1:9999/");
        assert_eq!(adapter.url("/v2/droplets"), "http://127.0.0.1:9999/v2/droplets");
    }
}
