use futures_util::{StreamExt, stream};

use hashbrown::HashSet;

use indexmap::IndexMap;

use tracing::{info, warn};

use crate::device::{DeviceInfo, DeviceRecord};
use crate::dispatch::Dispatcher;
use crate::registry::DeviceRegistry;

// Maximum number of registry calls in flight for a single batch.
const MAX_CONCURRENT_CALLS: usize = 8;

/// Operations supported by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Creates or updates device identities.
    Create,
    /// Retrieves device identities.
    Fetch,
    /// Deletes device identities.
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => "create",
            Self::Fetch => "fetch",
            Self::Delete => "delete",
        }
        .fmt(f)
    }
}

/// Outcome of a single item of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The operation has been accepted or completed.
    Success,
    /// The device has been found.
    Found(DeviceInfo),
    /// The registry does not know the device.
    NotFound,
    /// The operation failed with the given message.
    Error(String),
}

/// Records split into the ones to execute and the repeated ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// First occurrence of each identifier, in input order.
    pub selected: Vec<DeviceRecord>,
    /// Identifiers of every later occurrence, in input order.
    pub duplicated: Vec<String>,
}

/// Splits `records` into a [`Selection`].
///
/// The first occurrence of an identifier is selected, every later occurrence
/// is reported as duplicated.
#[must_use]
pub fn deduplicate(records: Vec<DeviceRecord>) -> Selection {
    let mut seen = HashSet::with_capacity(records.len());
    let mut selection = Selection::default();

    for record in records {
        if seen.contains(record.id.as_str()) {
            selection.duplicated.push(record.id);
            continue;
        }
        let _ = seen.insert(record.id.clone());
        selection.selected.push(record);
    }

    selection
}

/// Per-item results of a batch.
///
/// Every collection follows the input order. An item appears in exactly
/// one of `succeeded`, `duplicated`, `not_found` and `errors`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    /// Operation executed by the batch.
    pub operation: Operation,
    /// Accepted, found, or deleted identifiers.
    pub succeeded: Vec<String>,
    /// Device identities retrieved by a [`Operation::Fetch`] batch.
    pub found: IndexMap<String, DeviceInfo>,
    /// Repeated identifiers, excluded from execution.
    pub duplicated: Vec<String>,
    /// Identifiers unknown to the registry.
    pub not_found: Vec<String>,
    /// Failed identifiers along with their error message.
    pub errors: IndexMap<String, String>,
}

impl BatchResult {
    fn new(operation: Operation, duplicated: Vec<String>) -> Self {
        Self {
            operation,
            succeeded: Vec::new(),
            found: IndexMap::new(),
            duplicated,
            not_found: Vec::new(),
            errors: IndexMap::new(),
        }
    }

    /// Returns the number of distinct identifiers the batch has worked on.
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.not_found.len() + self.errors.len()
    }

    fn record(&mut self, id: String, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Success => self.succeeded.push(id),
            ItemOutcome::Found(device) => {
                self.succeeded.push(id.clone());
                let _ = self.found.insert(id, device);
            }
            ItemOutcome::NotFound => self.not_found.push(id),
            ItemOutcome::Error(message) => {
                let _ = self.errors.insert(id, message);
            }
        }
    }
}

/// Runs an [`Operation`] over a list of [`DeviceRecord`]s.
///
/// A failure of a single item never aborts the batch: it is recorded in
/// [`BatchResult::errors`] and the remaining items are still processed.
#[derive(Debug, Clone)]
pub struct BatchEngine<R> {
    registry: R,
    dispatcher: Dispatcher,
}

impl<R: DeviceRegistry> BatchEngine<R> {
    /// Creates a [`BatchEngine`].
    ///
    /// Creations are handed to the `dispatcher`, while fetches and deletions
    /// call the `registry` directly.
    #[must_use]
    pub const fn new(registry: R, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Returns the underlying registry.
    #[must_use]
    pub const fn registry(&self) -> &R {
        &self.registry
    }

    /// Returns the dispatcher used for deferred jobs.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Runs the given [`Operation`] over `records`.
    pub async fn process(&self, records: Vec<DeviceRecord>, operation: Operation) -> BatchResult {
        match operation {
            Operation::Create => self.create(records),
            Operation::Fetch => self.fetch(records).await,
            Operation::Delete => self.delete(records).await,
        }
    }

    /// Queues the creation of every distinct record.
    ///
    /// The result only tells which identifiers have been **accepted** for
    /// creation and which ones are duplicated, not whether each creation
    /// eventually succeeds.
    pub fn create(&self, records: Vec<DeviceRecord>) -> BatchResult {
        let Selection {
            selected,
            duplicated,
        } = deduplicate(records);
        let mut result = BatchResult::new(Operation::Create, duplicated);

        for DeviceRecord { id, status } in selected {
            let outcome = match self.dispatcher.create_device(id.clone(), status) {
                Ok(()) => ItemOutcome::Success,
                Err(e) => {
                    warn!("Creation of device `{id}` not accepted: {e}");
                    ItemOutcome::Error(e.to_string())
                }
            };
            result.record(id, outcome);
        }

        log_result(&result);
        result
    }

    /// Retrieves every distinct record.
    pub async fn fetch(&self, records: Vec<DeviceRecord>) -> BatchResult {
        self.run(Operation::Fetch, records, |id| async move {
            match self.registry.get_device(&id).await {
                Ok(Some(device)) => (id, ItemOutcome::Found(device)),
                Ok(None) => (id, ItemOutcome::NotFound),
                Err(e) => (id, ItemOutcome::Error(e.to_string())),
            }
        })
        .await
    }

    /// Deletes every distinct record.
    pub async fn delete(&self, records: Vec<DeviceRecord>) -> BatchResult {
        self.run(Operation::Delete, records, |id| async move {
            match self.registry.delete_device(&id).await {
                Ok(true) => (id, ItemOutcome::Success),
                Ok(false) => (id, ItemOutcome::NotFound),
                Err(e) => (id, ItemOutcome::Error(e.to_string())),
            }
        })
        .await
    }

    async fn run<F, Fut>(&self, operation: Operation, records: Vec<DeviceRecord>, call: F) -> BatchResult
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = (String, ItemOutcome)>,
    {
        let Selection {
            selected,
            duplicated,
        } = deduplicate(records);
        let mut result = BatchResult::new(operation, duplicated);

        // `buffered` yields in input order whatever the completion order is.
        let outcomes: Vec<(String, ItemOutcome)> = stream::iter(selected)
            .map(|record| record.id)
            .map(call)
            .buffered(MAX_CONCURRENT_CALLS)
            .collect()
            .await;

        for (id, outcome) in outcomes {
            result.record(id, outcome);
        }

        log_result(&result);
        result
    }
}

fn log_result(result: &BatchResult) {
    info!(
        "Batch {}: {} succeeded, {} duplicated, {} not found, {} failed",
        result.operation,
        result.succeeded.len(),
        result.duplicated.len(),
        result.not_found.len(),
        result.errors.len()
    );
}
