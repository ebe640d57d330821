//! The `podgate-server` crate exposes the `podgate-controller` APIs over
//! `HTTP`.
//!
//! It serves the pod commands and the device identity operations, either on
//! a single device or on a device list uploaded as a `CSV` file or read from
//! a shared spreadsheet. Batch endpoints always answer with a per-device
//! outcome, so a failing device never hides the others.

#![deny(missing_docs)]

/// Gateway settings.
pub mod config;
/// Answers sent to the clients.
pub mod responses;
/// Gateway routes and their handlers.
pub mod routes;
/// State shared by all request handlers.
pub mod state;

pub use routes::router;
