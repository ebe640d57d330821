use indexmap::IndexMap;

use podgate_controller::batch::BatchResult;
use podgate_controller::device::DeviceInfo;

use serde::Serialize;

const CREATION_INITIATED: &str = "device creation initiated";
const SUCCESS: &str = "success";

/// Origin of a device list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// An uploaded `CSV` file.
    Csv,
    /// The `CSV` export of a shared spreadsheet.
    GoogleSheet,
}

/// Answer to a batch creation.
///
/// Creations happen after the answer, so `created` lists the accepted
/// identifiers.
#[derive(Debug, Serialize)]
pub struct CreateResponse {
    status: &'static str,
    source: Source,
    created: Vec<String>,
    duplicated: Vec<String>,
    total: usize,
    errors: IndexMap<String, String>,
}

impl CreateResponse {
    /// Builds a [`CreateResponse`] from a creation batch.
    #[must_use]
    pub fn new(source: Source, result: BatchResult) -> Self {
        Self {
            status: CREATION_INITIATED,
            source,
            total: result.succeeded.len(),
            created: result.succeeded,
            duplicated: result.duplicated,
            errors: result.errors,
        }
    }
}

/// Answer to a batch retrieval.
#[derive(Debug, Serialize)]
pub struct FetchResponse {
    status: &'static str,
    source: Source,
    total: usize,
    found: IndexMap<String, DeviceInfo>,
    not_found: Vec<String>,
    duplicated: Vec<String>,
    errors: IndexMap<String, String>,
}

impl FetchResponse {
    /// Builds a [`FetchResponse`] from a retrieval batch.
    #[must_use]
    pub fn new(source: Source, result: BatchResult) -> Self {
        Self {
            status: SUCCESS,
            source,
            total: result.total(),
            found: result.found,
            not_found: result.not_found,
            duplicated: result.duplicated,
            errors: result.errors,
        }
    }
}

/// Answer to a batch deletion.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    status: &'static str,
    source: Source,
    total: usize,
    deleted: Vec<String>,
    not_found: Vec<String>,
    duplicated: Vec<String>,
    errors: IndexMap<String, String>,
}

impl DeleteResponse {
    /// Builds a [`DeleteResponse`] from a deletion batch.
    #[must_use]
    pub fn new(source: Source, result: BatchResult) -> Self {
        Self {
            status: SUCCESS,
            source,
            total: result.total(),
            deleted: result.succeeded,
            not_found: result.not_found,
            duplicated: result.duplicated,
            errors: result.errors,
        }
    }
}

/// Answer to a single device creation.
#[derive(Debug, Serialize)]
pub struct DeviceCreated {
    status: &'static str,
    pod_id: String,
}

impl DeviceCreated {
    /// Builds a [`DeviceCreated`] for the given identifier.
    #[must_use]
    pub const fn new(pod_id: String) -> Self {
        Self {
            status: CREATION_INITIATED,
            pod_id,
        }
    }
}

/// Answer to a single device retrieval.
#[derive(Debug, Serialize)]
pub struct DeviceFound {
    status: &'static str,
    device_info: DeviceInfo,
}

impl DeviceFound {
    /// Builds a [`DeviceFound`] for the given identity.
    #[must_use]
    pub const fn new(device_info: DeviceInfo) -> Self {
        Self {
            status: SUCCESS,
            device_info,
        }
    }
}

/// Answer to a single device deletion.
#[derive(Debug, Serialize)]
pub struct DeviceDeleted {
    status: &'static str,
    deleted: String,
}

impl DeviceDeleted {
    /// Builds a [`DeviceDeleted`] for the given identifier.
    #[must_use]
    pub const fn new(deleted: String) -> Self {
        Self {
            status: SUCCESS,
            deleted,
        }
    }
}

/// Answer to a pod opening.
#[derive(Debug, Serialize)]
pub struct PodOpening {
    status: &'static str,
    pod_id: u32,
    device_id: String,
}

impl PodOpening {
    /// Builds a [`PodOpening`] for an accepted command.
    #[must_use]
    pub const fn accepted(pod_id: u32, device_id: String) -> Self {
        Self {
            status: "accepted",
            pod_id,
            device_id,
        }
    }
}
