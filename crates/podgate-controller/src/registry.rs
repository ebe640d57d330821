use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, IF_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};

use serde_json::Value;

use tracing::debug;

use crate::config::RegistryConfig;
use crate::device::{DeviceIdentity, DeviceInfo, DeviceStatus};
use crate::error::{Error, ErrorKind, Result};
use crate::token::TokenCache;

/// Version of the registry REST API.
pub const API_VERSION: &str = "2021-04-12";

/// Timeout applied to every identity and command call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum size, in bytes, of a serialized device command.
pub const MAX_COMMAND_SIZE: usize = 64 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Operations on the device identities of a remote registry.
///
/// Every operation is a single remote call. Implementations must be cheap to
/// share across tasks.
pub trait DeviceRegistry: Send + Sync {
    /// Creates or updates the identity of a device, normalizing its status.
    fn create_or_update_device(
        &self,
        id: &str,
        status: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Retrieves the identity of a device, returning `None` when the
    /// registry does not know it.
    fn get_device(&self, id: &str) -> impl Future<Output = Result<Option<DeviceInfo>>> + Send;

    /// Deletes the identity of a device, returning `false` when the
    /// registry does not know it.
    fn delete_device(&self, id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Sends a command message to a device.
    fn send_command(&self, id: &str, payload: &Value) -> impl Future<Output = Result<()>> + Send;
}

/// A client for the REST API of the remote registry.
///
/// The underlying connection pool is shared among clones, and each call is
/// authenticated with a credential taken from the [`TokenCache`].
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: Client,
    base_url: Url,
    tokens: Arc<TokenCache>,
}

impl RegistryClient {
    /// Creates a [`RegistryClient`] for the `https` endpoint of the
    /// configured registry host.
    ///
    /// # Errors
    ///
    /// An error is returned if the HTTP client cannot be initialized.
    pub fn new(config: &RegistryConfig, tokens: Arc<TokenCache>) -> Result<Self> {
        Self::with_base_url(format!("https://{}", config.host.trim()), tokens)
    }

    /// Creates a [`RegistryClient`] for the given base URL.
    ///
    /// # Errors
    ///
    /// An error is returned if the base URL cannot hold a path, or
    /// if the HTTP client cannot be initialized.
    pub fn with_base_url(base_url: impl AsRef<str>, tokens: Arc<TokenCache>) -> Result<Self> {
        let base_url = base_url.as_ref().trim();
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| Error::configuration(format!("Invalid registry URL `{base_url}`")))?;

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    // Identifiers are pushed as single path segments, so `/` and spaces in
    // them are percent-encoded.
    fn endpoint(&self, id: &str, tail: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            let _ = segments
                .pop_if_empty()
                .push("devices")
                .push(id)
                .extend(tail);
        }
        let _ = url
            .query_pairs_mut()
            .clear()
            .append_pair("api-version", API_VERSION);
        url
    }

    fn device_url(&self, id: &str) -> Url {
        self.endpoint(id, &[])
    }

    fn command_url(&self, id: &str) -> Url {
        self.endpoint(id, &["messages", "deviceBound"])
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(AUTHORIZATION, self.tokens.token())
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
    }
}

impl DeviceRegistry for RegistryClient {
    async fn create_or_update_device(&self, id: &str, status: Option<&str>) -> Result<()> {
        let status = DeviceStatus::normalize(status);
        debug!("Upserting device `{id}` with status `{status}`");

        let response = self
            .authorized(self.client.put(self.device_url(id)))
            .json(&DeviceIdentity::new(id, status))
            .send()
            .await?;

        check_status(response).await.map(|_| ())
    }

    async fn get_device(&self, id: &str) -> Result<Option<DeviceInfo>> {
        debug!("Retrieving device `{id}`");

        let response = self
            .authorized(self.client.get(self.device_url(id)))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let device = check_status(response).await?.json::<DeviceInfo>().await?;
        Ok(Some(device))
    }

    async fn delete_device(&self, id: &str) -> Result<bool> {
        debug!("Deleting device `{id}`");

        let response = self
            .authorized(self.client.delete(self.device_url(id)))
            .header(IF_MATCH, "*")
            .send()
            .await?;

        // Same reading as `get_device`: an unknown device is not a failure.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        check_status(response).await.map(|_| true)
    }

    async fn send_command(&self, id: &str, payload: &Value) -> Result<()> {
        let body = serde_json::to_vec(payload)?;
        if body.len() > MAX_COMMAND_SIZE {
            return Err(Error::new(
                ErrorKind::Command,
                format!(
                    "Command for device `{id}` is {} bytes, the limit is {MAX_COMMAND_SIZE} bytes",
                    body.len()
                ),
            ));
        }

        debug!("Sending a command to device `{id}`");

        let response = self
            .authorized(self.client.post(self.command_url(id)))
            .body(body)
            .send()
            .await?;

        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(Error::remote(status.as_u16(), body))
}
