//! Identity provider: people and their reporting lines.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION, LINK};
use serde::Deserialize;
use tracing::debug;

use laggard_core::Person;

use crate::error::ConnectorError;

const PAGE_SIZE: usize = 200;
const SERVICE_ACCOUNT: &str = "Service Account";

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Every active person in the directory.
    async fn list_all_people(&self) -> Result<Vec<Person>, ConnectorError>;
}

/// Okta users API client. Authenticates with an `SSWS` API token.
pub struct OktaClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl OktaClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn from_config(
        config: &laggard_core::config::IdentityConfig,
    ) -> Result<Self, ConnectorError> {
        if !config.is_configured() {
            return Err(ConnectorError::NotConfigured(
                "OKTA_URL and OKTA_TOKEN are required".into(),
            ));
        }
        Ok(Self::new(config.url.clone(), config.token.clone()))
    }

    fn first_page_url(&self) -> String {
        format!(
            "{}/api/v1/users?limit={PAGE_SIZE}&filter=status+eq+%22ACTIVE%22",
            self.base_url
        )
    }
}

#[async_trait]
impl IdentityProvider for OktaClient {
    async fn list_all_people(&self) -> Result<Vec<Person>, ConnectorError> {
        let mut people = Vec::new();
        let mut next = Some(self.first_page_url());

        while let Some(url) = next.take() {
            debug!(url = %url, "Okta users page request");
            let response = self
                .client
                .get(&url)
                .header(AUTHORIZATION, format!("SSWS {}", self.token))
                .header("Accept", "application/json")
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(ConnectorError::from_response(response).await);
            }

            next = next_link(response.headers());
            let users: Vec<OktaUser> = response
                .json()
                .await
                .map_err(|e| ConnectorError::Parse(e.to_string()))?;

            people.extend(
                users
                    .into_iter()
                    .filter(|u| u.profile.user_type.as_deref() != Some(SERVICE_ACCOUNT))
                    .map(Person::from),
            );
        }

        debug!(count = people.len(), "Okta users listed");
        Ok(people)
    }
}

/// The `rel="next"` target from one or more `Link` headers.
fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .find_map(|part| {
            let (target, params) = part.split_once(';')?;
            let is_next = params
                .split(';')
                .any(|p| p.trim().trim_start_matches("rel=").trim_matches('"') == "next");
            is_next.then(|| {
                target
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
        })
}

#[derive(Debug, Deserialize)]
struct OktaUser {
    profile: OktaProfile,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OktaProfile {
    #[serde(default)]
    email: String,
    /// Holds the manager's email address in this directory.
    #[serde(default)]
    manager_id: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    user_type: Option<String>,
}

impl From<OktaUser> for Person {
    fn from(u: OktaUser) -> Self {
        let p = u.profile;
        Person {
            email: p.email,
            manager_email: p.manager_id.unwrap_or_default(),
            first_name: p.first_name.unwrap_or_default(),
            last_name: p.last_name.unwrap_or_default(),
        }
    }
}
