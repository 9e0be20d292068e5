//! Device inventory: the MDM's view of every managed endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use laggard_core::InventoryDevice;

use crate::error::ConnectorError;

/// Devices per page requested from the MDM.
pub const PAGE_SIZE: usize = 300;

#[async_trait]
pub trait InventoryProvider: Send + Sync {
    /// Every managed device, across all pages.
    async fn list_all(&self) -> Result<Vec<InventoryDevice>, ConnectorError>;
}

/// Kandji device API client.
pub struct KandjiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl KandjiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Build a client from configuration, failing when URL or token is unset.
    pub fn from_config(
        config: &laggard_core::config::InventoryConfig,
    ) -> Result<Self, ConnectorError> {
        if !config.is_configured() {
            return Err(ConnectorError::NotConfigured(
                "KANDJI_URL and KANDJI_TOKEN are required".into(),
            ));
        }
        Ok(Self::new(config.url.clone(), config.token.clone()))
    }

    async fn page(&self, offset: usize) -> Result<Vec<InventoryDevice>, ConnectorError> {
        let url = format!("{}/api/v1/devices", self.base_url);
        debug!(offset, "Kandji device page request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("limit", PAGE_SIZE), ("offset", offset)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ConnectorError::from_response(response).await);
        }

        let devices: Vec<KandjiDevice> = response
            .json()
            .await
            .map_err(|e| ConnectorError::Parse(e.to_string()))?;
        Ok(devices.into_iter().map(InventoryDevice::from).collect())
    }
}

#[async_trait]
impl InventoryProvider for KandjiClient {
    async fn list_all(&self) -> Result<Vec<InventoryDevice>, ConnectorError> {
        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.page(offset).await?;
            let n = page.len();
            all.extend(page);
            if n < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        debug!(count = all.len(), "Kandji inventory listed");
        Ok(all)
    }
}

#[derive(Debug, Deserialize)]
struct KandjiDevice {
    #[serde(default)]
    serial_number: String,
    #[serde(default)]
    os_version: String,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    user: Option<KandjiUser>,
}

/// The `user` field is an object for assigned devices and an empty string
/// for unassigned ones.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KandjiUser {
    Assigned {
        #[serde(default)]
        email: String,
        #[serde(default)]
        name: String,
        #[serde(default, deserialize_with = "string_or_number")]
        id: String,
    },
    Unassigned(serde_json::Value),
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = serde_json::Value::deserialize(deserializer)?;
    Ok(match v {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

impl From<KandjiDevice> for InventoryDevice {
    fn from(d: KandjiDevice) -> Self {
        let (owner_email, owner_name, owner_id) = match d.user {
            Some(KandjiUser::Assigned { email, name, id }) => (email, name, id),
            _ => Default::default(),
        };
        InventoryDevice {
            serial_number: d.serial_number,
            os_version: d.os_version,
            platform: d.platform,
            owner_email,
            owner_id,
            owner_name,
            device_name: d.device_name,
            model: d.model,
        }
    }
}
