//! The `podgate-controller` library crate provides a set of APIs for managing
//! the device identities stored on a remote IoT registry and for consuming
//! the telemetry stream its devices publish.
//!
//! Core functionalities of this crate include:
//!
//! - Signing short-lived access credentials for the remote registry and
//!   caching them until they are about to expire
//! - Creating, retrieving, and deleting device identities, one at a time or
//!   in batches where the failure of an item never aborts the others
//! - Sending commands to devices through a fire-and-forget job queue
//! - Converting `CSV` device lists, uploaded or downloaded from a shared
//!   spreadsheet, into batch inputs
//! - Consuming the telemetry stream on a dedicated thread, checkpointing
//!   every processed event
//!
//! Remote calls run on `tokio`. The telemetry consumer owns a separate
//! single-threaded runtime, so a busy stream never slows down the requests
//! served by the registry client.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Batch operations over device lists.
pub mod batch;
/// Gateway configuration.
pub mod config;
/// Device data.
pub mod device;
/// A queue of jobs executed after the caller has been answered.
pub mod dispatch;
/// Error management.
pub mod error;
/// Telemetry stream consumer and its lifecycle.
pub mod events;
/// Device list ingestion from `CSV` text and shared spreadsheets.
pub mod ingest;
/// Telemetry stream transport over an `MQTT` v5 broker.
pub mod mqtt;
/// A client for the REST API of the remote registry.
pub mod registry;
/// Signed access credentials for the remote registry.
pub mod token;
