//! DigitalOcean API Client
//!
//! ## API Endpoints
//!
//! | Endpoint | URL | Purpose |
//! |----------|-----|---------|
//! | Base URL | `https://api.digitalocean.com/v2` | All droplet APIs |
//! | Account | `/account` | Credential check |
//! | SSH keys | `/account/keys` | Find or register the cloudexec key |
//! | Snapshots | `/snapshots?resource_type=droplet` | Pick the boot image |
//! | Droplets | `/droplets` | Create, list by tag, delete |
//!
//! ## Authentication
//! - Header: `Authorization: Bearer {DIGITALOCEAN_API_KEY}`

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cx_state_store::{InstanceSize, ResourceHandle};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compute::{ComputeProvider, InstanceSpec};
use crate::error::{OrchestratorError, Result};

// =============================================================================
// API ENDPOINT CONFIGURATION
// =============================================================================

pub mod endpoints {
    pub const BASE_URL: &str = "https://api.digitalocean.com/v2";
    pub const ACCOUNT: &str = "/account";
    pub const SSH_KEYS: &str = "/account/keys";
    pub const SNAPSHOTS: &str = "/snapshots";
    pub const DROPLETS: &str = "/droplets";
}

/// Image used when no `cloudexec-*` snapshot exists
pub const DEFAULT_IMAGE: &str = "ubuntu-22-04-x64";
/// Snapshots whose names start with this are candidate boot images
pub const SNAPSHOT_PREFIX: &str = "cloudexec-";

const KEYS_PER_PAGE: u32 = 200;
const SNAPSHOTS_PER_PAGE: u32 = 50;
const DROPLETS_PER_PAGE: u32 = 200;

// =============================================================================
// DATA STRUCTURES
// =============================================================================

#[derive(Debug, Deserialize)]
struct AccountResponse {
    account: Account,
}

#[derive(Debug, Deserialize)]
struct Account {
    #[serde(default)]
    email: String,
    #[serde(default)]
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct KeysResponse {
    #[serde(default)]
    ssh_keys: Vec<SshKey>,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    ssh_key: SshKey,
}

#[derive(Debug, Deserialize)]
struct SshKey {
    name: String,
    fingerprint: String,
}

#[derive(Debug, Serialize)]
struct CreateKeyRequest<'a> {
    name: &'a str,
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct SnapshotsResponse {
    #[serde(default)]
    snapshots: Vec<Snapshot>,
    #[serde(default)]
    links: Links,
}

/// A saved droplet image
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    pages: Option<Pages>,
}

#[derive(Debug, Default, Deserialize)]
struct Pages {
    #[serde(default)]
    next: Option<String>,
}

impl Links {
    fn has_next(&self) -> bool {
        self.pages.as_ref().and_then(|p| p.next.as_ref()).is_some()
    }
}

#[derive(Debug, Serialize)]
struct CreateDropletRequest<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: serde_json::Value,
    ssh_keys: Vec<&'a str>,
    user_data: &'a str,
    tags: &'a [String],
    with_droplet_agent: bool,
}

#[derive(Debug, Deserialize)]
struct DropletResponse {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletsResponse {
    #[serde(default)]
    droplets: Vec<Droplet>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Clone, Deserialize)]
struct Droplet {
    id: i64,
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    networks: Networks,
    #[serde(default)]
    size: Option<DropletSize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Clone, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DropletSize {
    slug: String,
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    vcpus: u32,
    #[serde(default)]
    disk: u64,
    #[serde(default)]
    price_hourly: f64,
}

impl Droplet {
    fn public_ipv4(&self) -> Option<&str> {
        self.networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.as_str())
    }

    fn into_handle(self) -> ResourceHandle {
        let ip = self.public_ipv4().unwrap_or_default().to_string();
        ResourceHandle {
            name: self.name,
            id: self.id,
            ip,
            created: self.created_at,
            size: self.size.map(|s| InstanceSize {
                slug: s.slug,
                memory: s.memory,
                vcpus: s.vcpus,
                disk: s.disk,
                price_hourly: s.price_hourly,
            }),
        }
    }
}

/// Newest snapshot named `cloudexec-*`
pub fn latest_cloudexec_snapshot(snapshots: &[Snapshot]) -> Option<&Snapshot> {
    snapshots
        .iter()
        .filter(|s| s.name.starts_with(SNAPSHOT_PREFIX))
        .filter_map(|s| {
            DateTime::parse_from_rfc3339(&s.created_at)
                .ok()
                .map(|created| (created.with_timezone(&Utc), s))
        })
        .max_by_key(|(created, _)| *created)
        .map(|(_, s)| s)
}

/// `image` field of a create request: numeric snapshot ids go out as numbers,
/// anything else as a slug
fn image_value(image: &str) -> serde_json::Value {
    match image.parse::<i64>() {
        Ok(id) => serde_json::Value::from(id),
        Err(_) => serde_json::Value::from(image),
    }
}

// =============================================================================
// CLIENT IMPLEMENTATION
// =============================================================================

pub struct DigitalOceanProvider {
    client: Client,
    api_key: String,
    api_url: String,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl DigitalOceanProvider {
    /// Create a new client against the public API
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_url: endpoints::BASE_URL.to_string(),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(300),
        }
    }

    /// Create with custom endpoint
    pub fn with_endpoint(api_key: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let mut provider = Self::new(api_key);
        provider.api_url = endpoint.into();
        provider
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.api_url, path))
            .bearer_auth(&self.api_key)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::compute(format!(
                "{} failed ({}): {}",
                what, status, body
            )));
        }
        Ok(response.json::<T>().await?)
    }

    /// Boot image: the newest `cloudexec-*` snapshot, else the stock Ubuntu image
    pub async fn boot_image(&self) -> Result<String> {
        let mut snapshots = Vec::new();
        let mut page = 1;
        loop {
            let request = self.request(Method::GET, endpoints::SNAPSHOTS).query(&[
                ("resource_type", "droplet".to_string()),
                ("page", page.to_string()),
                ("per_page", SNAPSHOTS_PER_PAGE.to_string()),
            ]);
            let response: SnapshotsResponse = self.send(request, "List snapshots").await?;
            snapshots.extend(response.snapshots);
            if !response.links.has_next() {
                break;
            }
            page += 1;
        }

        Ok(match latest_cloudexec_snapshot(&snapshots) {
            Some(snapshot) => {
                debug!(snapshot = %snapshot.name, "Using cloudexec snapshot");
                snapshot.id.clone()
            }
            None => DEFAULT_IMAGE.to_string(),
        })
    }

    /// Fingerprint of the key registered as `name`, registering `public_key`
    /// under that name when absent
    async fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        let request = self
            .request(Method::GET, endpoints::SSH_KEYS)
            .query(&[("per_page", KEYS_PER_PAGE)]);
        let keys: KeysResponse = self.send(request, "List SSH keys").await?;
        if let Some(key) = keys.ssh_keys.into_iter().find(|k| k.name == name) {
            debug!(name, fingerprint = %key.fingerprint, "SSH key already registered");
            return Ok(key.fingerprint);
        }

        info!(name, "Registering SSH key with DigitalOcean");
        let request = self
            .request(Method::POST, endpoints::SSH_KEYS)
            .json(&CreateKeyRequest {
                name,
                public_key: public_key.trim(),
            });
        let created: KeyResponse = self.send(request, "Create SSH key").await?;
        Ok(created.ssh_key.fingerprint)
    }

    async fn get_droplet(&self, id: i64) -> Result<Droplet> {
        let request = self.request(Method::GET, &format!("{}/{}", endpoints::DROPLETS, id));
        let response: DropletResponse = self.send(request, "Get droplet").await?;
        Ok(response.droplet)
    }

    /// Poll until the droplet is active and has a public address
    async fn wait_for_active(&self, id: i64) -> Result<Droplet> {
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        loop {
            let droplet = self.get_droplet(id).await?;
            if droplet.status == "active" && droplet.public_ipv4().is_some() {
                return Ok(droplet);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::compute(format!(
                    "droplet {} still '{}' after {:?}",
                    id, droplet.status, self.poll_timeout
                )));
            }
            debug!(droplet_id = id, status = %droplet.status, "Waiting for droplet");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ComputeProvider for DigitalOceanProvider {
    async fn check_auth(&self) -> Result<String> {
        let request = self.request(Method::GET, endpoints::ACCOUNT);
        let response: AccountResponse = self.send(request, "Authenticate").await?;
        let account = response.account;
        Ok(if account.email.is_empty() {
            account.uuid
        } else {
            account.email
        })
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ResourceHandle> {
        let fingerprint = self.ensure_ssh_key(&spec.key_name, &spec.public_key).await?;
        let image = self.boot_image().await?;

        info!(name = %spec.name, region = %spec.region, size = %spec.size, %image, "Creating droplet");
        let request = self
            .request(Method::POST, endpoints::DROPLETS)
            .json(&CreateDropletRequest {
                name: &spec.name,
                region: &spec.region,
                size: &spec.size,
                image: image_value(&image),
                ssh_keys: vec![fingerprint.as_str()],
                user_data: &spec.user_data,
                tags: &spec.tags,
                with_droplet_agent: false,
            });
        let created: DropletResponse = self.send(request, "Create droplet").await?;

        let droplet = self.wait_for_active(created.droplet.id).await?;
        let handle = droplet.into_handle();
        info!(droplet_id = handle.id, ip = %handle.ip, "Droplet active");
        Ok(handle)
    }

    async fn list_instances_by_tag(&self, tag: &str) -> Result<Vec<ResourceHandle>> {
        let mut handles = Vec::new();
        let mut page = 1;
        loop {
            let request = self.request(Method::GET, endpoints::DROPLETS).query(&[
                ("tag_name", tag.to_string()),
                ("page", page.to_string()),
                ("per_page", DROPLETS_PER_PAGE.to_string()),
            ]);
            let response: DropletsResponse = self.send(request, "List droplets").await?;
            handles.extend(response.droplets.into_iter().map(Droplet::into_handle));
            if !response.links.has_next() {
                break;
            }
            page += 1;
        }
        Ok(handles)
    }

    async fn delete_instance(&self, id: i64) -> Result<()> {
        let response = self
            .request(Method::DELETE, &format!("{}/{}", endpoints::DROPLETS, id))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {
                info!(droplet_id = id, "Droplet destroyed");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                warn!(droplet_id = id, "Droplet already gone");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(OrchestratorError::compute(format!(
                    "Delete droplet {} failed ({}): {}",
                    id, status, body
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, name: &str, created_at: &str) -> Snapshot {
        Snapshot {
            id: id.into(),
            name: name.into(),
            created_at: created_at.into(),
        }
    }

    #[test]
    fn test_latest_snapshot_selection() {
        let snapshots = vec![
            snapshot("1", "cloudexec-old", "2023-01-01T00:00:00Z"),
            snapshot("2", "unrelated", "2024-06-01T00:00:00Z"),
            snapshot("3", "cloudexec-new", "2023-09-01T00:00:00Z"),
        ];
        assert_eq!(latest_cloudexec_snapshot(&snapshots).unwrap().id, "3");
        assert!(latest_cloudexec_snapshot(&snapshots[1..2]).is_none());
    }

    #[test]
    fn test_image_value() {
        assert_eq!(image_value("12345"), serde_json::json!(12345));
        assert_eq!(image_value(DEFAULT_IMAGE), serde_json::json!(DEFAULT_IMAGE));
    }

    #[test]
    fn test_droplet_into_handle() {
        let droplet: Droplet = serde_json::from_value(serde_json::json!({
            "id": 3164444,
            "name": "cloudexec-alice-4",
            "status": "active",
            "created_at": "2024-03-01T10:00:00Z",
            "networks": {"v4": [
                {"ip_address": "10.128.0.2", "type": "private"},
                {"ip_address": "203.0.113.9", "type": "public"}
            ]},
            "size": {"slug": "c-2", "memory": 4096, "vcpus": 2, "disk": 25, "price_hourly": 0.0625}
        }))
        .unwrap();

        let handle = droplet.into_handle();
        assert_eq!(handle.id, 3164444);
        assert_eq!(handle.ip, "203.0.113.9");
        assert_eq!(handle.size.unwrap().vcpus, 2);
    }

    #[test]
    fn test_pagination_links() {
        let last: DropletsResponse =
            serde_json::from_value(serde_json::json!({"droplets": [], "links": {}})).unwrap();
        assert!(!last.links.has_next());
        let more: DropletsResponse = serde_json::from_value(serde_json::json!({
            "droplets": [],
            "links": {"pages": {"next": "https://api.digitalocean.com/v2/droplets?page=2"}}
        }))
        .unwrap();
        assert!(more.links.has_next());
    }
}
