use std::sync::Arc;

use futures_util::StreamExt;

use serde_json::Value;

use tokio::task::JoinHandle;

use tracing::{debug, error, info};

use crate::error::{Error, ErrorKind, Result};
use crate::registry::DeviceRegistry;

// Maximum number of jobs executed at the same time.
const MAX_IN_FLIGHT_JOBS: usize = 16;

/// A job executed after the caller has already received its answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// Creates or updates a device identity.
    CreateDevice {
        /// Device identifier.
        id: String,
        /// Desired status, as received.
        status: Option<String>,
    },
    /// Sends a command to a device.
    SendCommand {
        /// Device identifier.
        id: String,
        /// Command payload.
        payload: Value,
    },
}

/// A fire-and-forget job queue in front of a [`DeviceRegistry`].
///
/// Queuing a job only means that the job has been **accepted**: the caller
/// receives no completion signal and a failing job is only logged.
///
/// The worker task stops once every [`Dispatcher`] clone has been dropped
/// and all queued jobs have been executed.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sender: flume::Sender<Job>,
}

impl Dispatcher {
    /// Spawns the worker task on the current runtime and returns the
    /// [`Dispatcher`] feeding it, along with the worker handle.
    pub fn spawn<R>(registry: R) -> (Self, JoinHandle<()>)
    where
        R: DeviceRegistry + 'static,
    {
        let (sender, receiver) = flume::unbounded();
        let handle = tokio::spawn(run_worker(registry, receiver));
        (Self { sender }, handle)
    }

    /// Queues the creation of a device identity.
    ///
    /// # Errors
    ///
    /// An error is returned if the worker task is no longer running.
    pub fn create_device(&self, id: impl Into<String>, status: Option<String>) -> Result<()> {
        self.submit(Job::CreateDevice {
            id: id.into(),
            status,
        })
    }

    /// Queues a command for a device.
    ///
    /// # Errors
    ///
    /// An error is returned if the worker task is no longer running.
    pub fn send_command(&self, id: impl Into<String>, payload: Value) -> Result<()> {
        self.submit(Job::SendCommand {
            id: id.into(),
            payload,
        })
    }

    /// Queues a [`Job`].
    ///
    /// # Errors
    ///
    /// An error is returned if the worker task is no longer running.
    pub fn submit(&self, job: Job) -> Result<()> {
        self.sender.send(job).map_err(|e| {
            Error::new(
                ErrorKind::Dispatch,
                format!("The dispatcher is not running, job discarded: {:?}", e.into_inner()),
            )
        })
    }
}

async fn run_worker<R: DeviceRegistry>(registry: R, receiver: flume::Receiver<Job>) {
    info!("Dispatcher started");

    let registry = Arc::new(registry);
    receiver
        .into_stream()
        .for_each_concurrent(MAX_IN_FLIGHT_JOBS, |job| {
            let registry = Arc::clone(&registry);
            async move { execute(registry.as_ref(), job).await }
        })
        .await;

    info!("Dispatcher stopped");
}

async fn execute<R: DeviceRegistry>(registry: &R, job: Job) {
    match job {
        Job::CreateDevice { id, status } => {
            match registry.create_or_update_device(&id, status.as_deref()).await {
                Ok(()) => debug!("Device `{id}` created"),
                Err(e) => error!("Failed to create device `{id}`: {e}"),
            }
        }
        Job::SendCommand { id, payload } => match registry.send_command(&id, &payload).await {
            Ok(()) => debug!("Command delivered to device `{id}`"),
            Err(e) => error!("Failed to send a command to device `{id}`: {e}"),
        },
    }
}
