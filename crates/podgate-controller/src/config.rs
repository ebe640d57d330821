use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};

/// Settings needed to reach and authenticate against the remote registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Registry host name, e.g. `myhub.azure-devices.net`.
    ///
    /// It is also the resource identifier signed into every credential.
    pub host: String,
    /// Name of the shared access policy used to sign credentials.
    pub policy_name: String,
    /// Base64 encoded shared access policy key.
    pub policy_key: String,
}

impl RegistryConfig {
    /// Creates a [`RegistryConfig`].
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        policy_name: impl Into<String>,
        policy_key: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            policy_name: policy_name.into(),
            policy_key: policy_key.into(),
        }
    }

    /// Checks that every value is present and that the policy key is valid
    /// base64, returning the decoded key.
    ///
    /// # Errors
    ///
    /// A configuration error is returned when a value is empty or when the
    /// policy key cannot be decoded.
    pub fn validate(&self) -> Result<Vec<u8>> {
        required("registry host", &self.host)?;
        required("registry policy name", &self.policy_name)?;
        required("registry policy key", &self.policy_key)?;

        STANDARD
            .decode(self.policy_key.trim())
            .map_err(|e| Error::configuration(format!("Registry policy key is not base64: {e}")))
    }
}

/// Settings needed to subscribe to the telemetry stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream connection string.
    pub connection_string: String,
    /// Consumer group sharing the stream partitions.
    pub consumer_group: String,
    /// Stream name.
    pub stream_name: String,
}

impl StreamConfig {
    /// Creates a [`StreamConfig`].
    #[must_use]
    pub fn new(
        connection_string: impl Into<String>,
        consumer_group: impl Into<String>,
        stream_name: impl Into<String>,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            consumer_group: consumer_group.into(),
            stream_name: stream_name.into(),
        }
    }

    /// Checks that every value is present.
    ///
    /// # Errors
    ///
    /// A configuration error is returned when a value is empty.
    pub fn validate(&self) -> Result<()> {
        required("stream connection string", &self.connection_string)?;
        required("stream consumer group", &self.consumer_group)?;
        required("stream name", &self.stream_name)
    }
}

/// The whole gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Remote registry settings.
    pub registry: RegistryConfig,
    /// Telemetry stream settings.
    pub stream: StreamConfig,
}

impl GatewayConfig {
    /// Validates both the registry and the stream settings.
    ///
    /// # Errors
    ///
    /// The first invalid setting is reported as a configuration error.
    pub fn validate(&self) -> Result<()> {
        let _ = self.registry.validate()?;
        self.stream.validate()
    }
}

fn required(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::configuration(format!("Missing {name}")))
    } else {
        Ok(())
    }
}
