use std::time::Duration;

use hashbrown::HashMap;

use reqwest::Url;

use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions};

use tracing::{debug, error, info};

use crate::config::StreamConfig;
use crate::error::{Error, Result};
use crate::events::{EventSession, EventSource, SessionEvent, TelemetryEvent};

/// Broker port used when the connection string does not carry one.
pub const DEFAULT_PORT: u16 = 1883;

// Scheme of a broker connection string.
const SCHEME: &str = "mqtt";

// Keep alive time to send `pingreq` to broker when the connection is idle.
const KEEP_ALIVE_TIME: Duration = Duration::from_secs(5);

// The capacity of the bounded asynchronous channel.
const ASYNC_CHANNEL_CAPACITY: usize = 10;

// Maximum time spent flushing the disconnection request.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// Partition of the events published on the stream topic itself.
const DEFAULT_PARTITION: &str = "0";

/// Broker location and credentials, parsed from a connection string of the
/// form `mqtt://[user[:password]@]host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// User name and password.
    pub credentials: Option<(String, String)>,
}

impl BrokerAddress {
    /// Parses a connection string.
    ///
    /// # Errors
    ///
    /// A configuration error is returned when the connection string is not
    /// a valid `mqtt` URL or it lacks a host.
    pub fn parse(connection_string: &str) -> Result<Self> {
        let url = Url::parse(connection_string.trim()).map_err(|e| {
            Error::configuration(format!("Invalid stream connection string: {e}"))
        })?;

        if url.scheme() != SCHEME {
            return Err(Error::configuration(format!(
                "Unsupported stream scheme `{}`, expected `{SCHEME}`",
                url.scheme()
            )));
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(Error::configuration(
                    "Missing host in the stream connection string",
                ));
            }
        };

        let credentials = (!url.username().is_empty()).then(|| {
            (
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            )
        });

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            credentials,
        })
    }
}

/// A telemetry stream exposed by an `MQTT` v5 broker.
///
/// The consumer group is mapped onto a shared subscription, so the members
/// of a group split the stream among themselves. Sessions start clean and
/// receive only the events published after the subscription. An event is
/// checkpointed by acknowledging its publish packet.
#[derive(Debug, Clone)]
pub struct MqttEventSource {
    broker: BrokerAddress,
    stream_name: String,
    filter: String,
    client_id: String,
}

impl MqttEventSource {
    /// Creates a [`MqttEventSource`] from the stream settings.
    ///
    /// # Errors
    ///
    /// A configuration error is returned when a setting is missing or the
    /// connection string is invalid.
    pub fn new(config: &StreamConfig) -> Result<Self> {
        config.validate()?;
        let broker = BrokerAddress::parse(&config.connection_string)?;

        let group = config.consumer_group.trim();
        let stream_name = config.stream_name.trim().trim_end_matches('/');

        Ok(Self {
            broker,
            stream_name: stream_name.into(),
            filter: format!("$share/{group}/{stream_name}/#"),
            client_id: format!("podgate-{group}-{}", std::process::id()),
        })
    }

    /// Returns the broker address.
    #[must_use]
    pub const fn broker(&self) -> &BrokerAddress {
        &self.broker
    }

    /// Returns the subscription filter.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

impl EventSource for MqttEventSource {
    type Session = MqttSession;

    async fn open(&self) -> Result<MqttSession> {
        let BrokerAddress {
            host,
            port,
            credentials,
        } = &self.broker;

        let mut options = MqttOptions::new(self.client_id.as_str(), host.as_str(), *port);
        let _ = options
            .set_keep_alive(KEEP_ALIVE_TIME)
            .set_clean_start(true)
            .set_manual_acks(true);
        if let Some((user, password)) = credentials {
            let _ = options.set_credentials(user.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, ASYNC_CHANNEL_CAPACITY);
        client
            .subscribe(self.filter.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                error!("Impossible to subscribe to `{}`: {e}", self.filter);
                e
            })?;

        info!("Subscribed to `{}` on {host}:{port}", self.filter);

        Ok(MqttSession {
            client,
            eventloop,
            stream_name: self.stream_name.clone(),
            filter: self.filter.clone(),
            sequences: HashMap::new(),
            pending: HashMap::new(),
        })
    }
}

/// An open subscription on an `MQTT` broker.
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    stream_name: String,
    filter: String,
    // Last sequence number assigned on each partition.
    sequences: HashMap<String, u64>,
    // Received publish packets still waiting for their acknowledgement.
    pending: HashMap<(String, u64), Publish>,
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("filter", &self.filter)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl MqttSession {
    fn received(&mut self, publish: Publish) -> TelemetryEvent {
        let topic = String::from_utf8_lossy(&publish.topic);
        let partition_id = partition_of(&self.stream_name, &topic).to_string();

        let sequence = self.sequences.entry(partition_id.clone()).or_insert(0);
        *sequence += 1;
        let sequence = *sequence;

        let properties = publish
            .properties
            .as_ref()
            .map(|properties| properties.user_properties.iter().cloned().collect())
            .unwrap_or_default();

        let event = TelemetryEvent {
            partition_id: partition_id.clone(),
            sequence,
            body: publish.payload.clone(),
            properties,
        };
        let _ = self.pending.insert((partition_id, sequence), publish);

        event
    }
}

impl EventSession for MqttSession {
    async fn next_event(&mut self) -> Result<Option<SessionEvent>> {
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => {
                    return Ok(Some(SessionEvent::Received(self.received(publish))));
                }
                Event::Incoming(Packet::SubAck(_)) => {
                    return Ok(Some(SessionEvent::PartitionAttached(self.filter.clone())));
                }
                Event::Incoming(Packet::Disconnect(disconnect)) => {
                    debug!("Broker disconnection: {:?}", disconnect.reason_code);
                    return Ok(Some(SessionEvent::PartitionDetached(self.filter.clone())));
                }
                Event::Incoming(Packet::ConnAck(_)) => debug!("Connected to the broker"),
                _ => {}
            }
        }
    }

    async fn checkpoint(&mut self, event: &TelemetryEvent) -> Result<()> {
        let Some(publish) = self
            .pending
            .remove(&(event.partition_id.clone(), event.sequence))
        else {
            return Err(Error::stream_session(format!(
                "No pending event {} on partition {}",
                event.sequence, event.partition_id
            )));
        };

        self.client.ack(&publish).await?;
        Ok(())
    }

    async fn close(mut self) -> Result<()> {
        self.client.disconnect().await?;

        // The request is only sent while the event loop is polled.
        let flush = async {
            while self.eventloop.poll().await.is_ok() {}
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, flush).await.is_err() {
            debug!("Disconnection not flushed within {CLOSE_TIMEOUT:?}");
        }

        Ok(())
    }
}

// Events published on `{stream}/{partition}/...` belong to `partition`.
fn partition_of<'a>(stream_name: &str, topic: &'a str) -> &'a str {
    topic
        .strip_prefix(stream_name)
        .and_then(|rest| rest.strip_prefix('/'))
        .and_then(|rest| rest.split('/').next())
        .filter(|partition| !partition.is_empty())
        .unwrap_or(DEFAULT_PARTITION)
}
