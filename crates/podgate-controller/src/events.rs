use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;

use indexmap::IndexMap;

use parking_lot::Mutex;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

// Name of the dedicated consumer thread.
const CONSUMER_THREAD_NAME: &str = "telemetry-consumer";

/// An event received from the telemetry stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    /// Partition the event has been received from.
    pub partition_id: String,
    /// Position of the event within its partition.
    pub sequence: u64,
    /// Raw event body.
    pub body: Bytes,
    /// Application properties attached to the event.
    pub properties: IndexMap<String, String>,
}

impl TelemetryEvent {
    /// Returns the event body decoded as text, replacing invalid sequences.
    #[must_use]
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Notifications produced by an [`EventSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A telemetry event has been received.
    Received(TelemetryEvent),
    /// The session started receiving from a partition.
    PartitionAttached(String),
    /// The session stopped receiving from a partition.
    PartitionDetached(String),
}

/// A telemetry stream able to open subscription sessions.
pub trait EventSource: Send + Sync {
    /// The session type opened by this source.
    type Session: EventSession;

    /// Opens a consumer-group-scoped session positioned at the **latest**
    /// event, so previously published events are not replayed.
    fn open(&self) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// An open subscription to a telemetry stream.
pub trait EventSession: Send {
    /// Waits for the next notification.
    ///
    /// `None` means that the stream has ended.
    fn next_event(&mut self) -> impl Future<Output = Result<Option<SessionEvent>>> + Send;

    /// Tells the stream that `event` has been processed.
    fn checkpoint(&mut self, event: &TelemetryEvent) -> impl Future<Output = Result<()>> + Send;

    /// Closes the session.
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// Lifecycle states of a [`StreamConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No session is open.
    Idle,
    /// A session is being opened.
    Starting,
    /// A session is open and events are being processed.
    Running,
    /// A stop has been requested and the session is being closed.
    Stopping,
}

#[derive(Debug)]
struct Lifecycle {
    state: ConsumerState,
    token: Option<CancellationToken>,
}

/// A long-lived consumer of a telemetry stream.
///
/// At most one session is open at a time: calling [`StreamConsumer::start`]
/// while a session is active is a no-op. Every processed event is
/// checkpointed.
///
/// A stop requested while the consumer is idle cancels the next start.
#[derive(Debug)]
pub struct StreamConsumer<S> {
    source: S,
    lifecycle: Mutex<Lifecycle>,
    stop_requested: AtomicBool,
}

impl<S: EventSource> StreamConsumer<S> {
    /// Creates an idle [`StreamConsumer`] reading from `source`.
    #[must_use]
    pub const fn new(source: S) -> Self {
        Self {
            source,
            lifecycle: Mutex::new(Lifecycle {
                state: ConsumerState::Idle,
                token: None,
            }),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Returns the current [`ConsumerState`].
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.lifecycle.lock().state
    }

    /// Returns whether a stop has been requested.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Opens a session and processes its events until the session ends or
    /// [`StreamConsumer::stop`] is called.
    ///
    /// # Errors
    ///
    /// Session failures are returned, unless they happen after a stop has
    /// been requested.
    pub async fn start(&self) -> Result<()> {
        let token = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConsumerState::Idle {
                warn!("Telemetry consumer already {:?}, start ignored", lifecycle.state);
                return Ok(());
            }
            if self.stop_requested.swap(false, Ordering::SeqCst) {
                info!("Telemetry consumer stopped before starting");
                return Ok(());
            }

            let token = CancellationToken::new();
            lifecycle.state = ConsumerState::Starting;
            lifecycle.token = Some(token.clone());
            token
        };

        let result = self.run(&token).await;

        let stop_requested = {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ConsumerState::Idle;
            lifecycle.token = None;
            self.stop_requested.swap(false, Ordering::SeqCst)
        };

        info!("Telemetry consumer stopped");

        match result {
            Err(e) if stop_requested => {
                debug!("Session error during shutdown ignored: {e}");
                Ok(())
            }
            result => result,
        }
    }

    /// Requests the consumer to stop, unblocking [`StreamConsumer::start`].
    ///
    /// Calling it more than once has no further effect.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            debug!("Telemetry consumer stop already requested");
            return;
        }

        match lifecycle.state {
            ConsumerState::Idle | ConsumerState::Stopping => {}
            ConsumerState::Starting | ConsumerState::Running => {
                info!("Stopping telemetry consumer");
                lifecycle.state = ConsumerState::Stopping;
                if let Some(token) = &lifecycle.token {
                    token.cancel();
                }
            }
        }
    }

    async fn run(&self, token: &CancellationToken) -> Result<()> {
        let mut session = tokio::select! {
            () = token.cancelled() => return Ok(()),
            session = self.source.open() => session?,
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ConsumerState::Starting {
                lifecycle.state = ConsumerState::Running;
            }
        }
        info!("Telemetry consumer running");

        let result = loop {
            let event = tokio::select! {
                () = token.cancelled() => break Ok(()),
                event = session.next_event() => event,
            };

            match event {
                Ok(Some(event)) => self.handle(&mut session, event).await,
                Ok(None) => {
                    info!("Telemetry stream ended");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        let closed = session.close().await;
        result.and(closed)
    }

    async fn handle(&self, session: &mut S::Session, event: SessionEvent) {
        match event {
            SessionEvent::Received(event) => {
                if self.is_stop_requested() {
                    return;
                }

                info!(
                    "Telemetry from partition {} (sequence {}): {} {:?}",
                    event.partition_id,
                    event.sequence,
                    event.body_text(),
                    event.properties
                );

                if let Err(e) = session.checkpoint(&event).await {
                    error!(
                        "Checkpoint failed for partition {} (sequence {}): {e}",
                        event.partition_id, event.sequence
                    );
                }
            }
            SessionEvent::PartitionAttached(partition) => {
                info!("Partition {partition} attached");
            }
            SessionEvent::PartitionDetached(partition) => {
                info!("Partition {partition} detached");
            }
        }
    }
}

/// A [`StreamConsumer`] running on a dedicated thread with its own
/// single-threaded runtime.
#[derive(Debug)]
pub struct ConsumerThread<S> {
    consumer: Arc<StreamConsumer<S>>,
    done: flume::Receiver<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl<S: EventSource + 'static> ConsumerThread<S> {
    /// Spawns the consumer thread and starts `consumer` on it.
    ///
    /// Session failures are logged by the thread.
    ///
    /// # Errors
    ///
    /// An error is returned if the thread cannot be spawned.
    pub fn spawn(consumer: Arc<StreamConsumer<S>>) -> Result<Self> {
        let (done_sender, done) = flume::bounded(1);
        let thread_consumer = Arc::clone(&consumer);

        let handle = std::thread::Builder::new()
            .name(CONSUMER_THREAD_NAME.into())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => {
                        if let Err(e) = runtime.block_on(thread_consumer.start()) {
                            error!("Telemetry consumer failed: {e}");
                        }
                    }
                    Err(e) => error!("Unable to build the telemetry consumer runtime: {e}"),
                }
                let _ = done_sender.send(());
            })
            .map_err(|e| Error::stream_session(format!("Unable to spawn the consumer thread: {e}")))?;

        Ok(Self {
            consumer,
            done,
            handle: Some(handle),
        })
    }

    /// Returns the consumer running on the thread.
    #[must_use]
    pub fn consumer(&self) -> &StreamConsumer<S> {
        &self.consumer
    }

    /// Stops the consumer and waits at most `grace` for the thread to exit.
    ///
    /// Returns `false` when the thread is still running after `grace`, in
    /// which case it is left behind.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        self.consumer.stop();

        if tokio::time::timeout(grace, self.done.recv_async()).await.is_err() {
            warn!("Telemetry consumer thread still running after {grace:?}, leaking it");
            return false;
        }

        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("Telemetry consumer thread panicked");
        }

        info!("Telemetry consumer thread exited");
        true
    }
}
