//! One-shot lookup of the services this agent may stream for.

use std::sync::Arc;

use driplet_proto::ServiceDescriptor;
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

use crate::config::Credentials;
use crate::error::DiscoveryError;

#[derive(Clone)]
pub struct DiscoveryClient {
    http: Client,
    base_url: String,
    credentials: Arc<Credentials>,
}

impl DiscoveryClient {
    /// `api_host` may be a bare host (`https://` is assumed) or a full base URL.
    pub fn new(api_host: &str, credentials: Arc<Credentials>) -> Self {
        Self {
            http: Client::new(),
            base_url: http_base(api_host),
            credentials,
        }
    }

    /// The user id is one percent-encoded path segment.
    pub fn services_url(&self) -> Result<Url, DiscoveryError> {
        let invalid = |source| DiscoveryError::InvalidUrl {
            url: self.base_url.clone(),
            source,
        };
        let mut url = Url::parse(&self.base_url).map_err(invalid)?;
        url.path_segments_mut()
            .map_err(|()| invalid(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(["endpoints", self.credentials.user_id.as_str(), "services"]);
        Ok(url)
    }

    pub async fn fetch_services(&self) -> Result<Vec<ServiceDescriptor>, DiscoveryError> {
        let url = self.services_url()?;
        debug!(%url, "requesting service list");
        let res = self
            .http
            .get(url)
            .header("authorization", &self.credentials.auth_token)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(DiscoveryError::UnexpectedStatus { status, body });
        }

        let body = res.bytes().await?;
        let services: Vec<ServiceDescriptor> = serde_json::from_slice(&body)?;
        for service in &services {
            info!(
                service_id = %service.id,
                log_command = %service.log_command,
                "discovered service"
            );
        }
        Ok(services)
    }
}

fn http_base(host: &str) -> String {
    let trimmed = host.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}
