use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use indexmap::IndexMap;

use podgate_controller::config::{GatewayConfig, RegistryConfig, StreamConfig};

/// Gateway settings, read from the command line or from the environment.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Remote registry host name.
    #[arg(long, env = "IOTHUB_NAME")]
    pub iothub_name: String,

    /// Name of the shared access policy signing registry credentials.
    #[arg(long, env = "IOTHUB_POLICY_NAME")]
    pub policy_name: String,

    /// Base64 encoded shared access policy key.
    #[arg(long, env = "IOTHUB_POLICY_KEY", hide_env_values = true)]
    pub policy_key: String,

    /// Telemetry stream connection string, `mqtt://[user[:password]@]host[:port]`.
    #[arg(long, env = "TELEMETRY_CONNECTION_STRING", hide_env_values = true)]
    pub connection_string: String,

    /// Consumer group sharing the telemetry stream.
    #[arg(long, env = "TELEMETRY_CONSUMER_GROUP")]
    pub consumer_group: String,

    /// Telemetry stream name.
    #[arg(long, env = "TELEMETRY_STREAM_NAME")]
    pub stream_name: String,

    /// Address the HTTP server listens on.
    #[arg(long, env = "PODGATE_ADDRESS", default_value = "0.0.0.0:8000")]
    pub address: SocketAddr,

    /// Pods to devices mapping, e.g. `1=pod-a,2=pod-b`.
    #[arg(long, env = "PODGATE_POD_MAP", default_value = "")]
    pub pod_map: PodMap,

    /// Seconds granted to the telemetry consumer to stop on shutdown.
    #[arg(long, env = "PODGATE_GRACE_SECS", default_value_t = 5)]
    pub grace_secs: u64,
}

impl Cli {
    /// Returns the settings of the controller library.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            registry: RegistryConfig::new(&self.iothub_name, &self.policy_name, &self.policy_key),
            stream: StreamConfig::new(
                &self.connection_string,
                &self.consumer_group,
                &self.stream_name,
            ),
        }
    }

    /// Returns the shutdown grace period.
    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

/// Mapping from numeric pod identifiers to device identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodMap(IndexMap<u32, String>);

impl PodMap {
    /// Returns the device identifier of a pod.
    #[must_use]
    pub fn device_for(&self, pod_id: u32) -> Option<&str> {
        self.0.get(&pod_id).map(String::as_str)
    }

    /// Returns the number of mapped pods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether no pod is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u32, String)> for PodMap {
    fn from_iter<I: IntoIterator<Item = (u32, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for PodMap {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (pod, device) = entry
                    .split_once('=')
                    .ok_or_else(|| format!("Invalid pod mapping `{entry}`, expected `pod=device`"))?;

                let pod = pod
                    .trim()
                    .parse::<u32>()
                    .map_err(|e| format!("Invalid pod identifier in `{entry}`: {e}"))?;

                let device = device.trim();
                if device.is_empty() {
                    return Err(format!("Missing device identifier in `{entry}`"));
                }

                Ok((pod, device.to_string()))
            })
            .collect()
    }
}
