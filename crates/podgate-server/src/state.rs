use std::sync::Arc;

use podgate_controller::batch::BatchEngine;
use podgate_controller::dispatch::Dispatcher;
use podgate_controller::error::Result;
use podgate_controller::ingest::SheetFetcher;
use podgate_controller::registry::DeviceRegistry;

use tokio::task::JoinHandle;

use crate::config::PodMap;

/// State shared by all request handlers.
#[derive(Debug)]
pub struct AppState<R> {
    pub(crate) batches: Arc<BatchEngine<R>>,
    pub(crate) pods: Arc<PodMap>,
    pub(crate) sheets: SheetFetcher,
}

impl<R> Clone for AppState<R> {
    fn clone(&self) -> Self {
        Self {
            batches: Arc::clone(&self.batches),
            pods: Arc::clone(&self.pods),
            sheets: self.sheets.clone(),
        }
    }
}

impl<R: DeviceRegistry + Clone + 'static> AppState<R> {
    /// Creates an [`AppState`], spawning the worker that executes deferred
    /// jobs on the current runtime.
    ///
    /// The worker handle completes once every clone of the state has been
    /// dropped and the queued jobs have been executed.
    ///
    /// # Errors
    ///
    /// An error is returned if the spreadsheet client cannot be initialized.
    pub fn new(registry: R, pods: PodMap) -> Result<(Self, JoinHandle<()>)> {
        let sheets = SheetFetcher::new()?;
        let (dispatcher, worker) = Dispatcher::spawn(registry.clone());

        let state = Self {
            batches: Arc::new(BatchEngine::new(registry, dispatcher)),
            pods: Arc::new(pods),
            sheets,
        };

        Ok((state, worker))
    }
}

impl<R: DeviceRegistry> AppState<R> {
    pub(crate) fn registry(&self) -> &R {
        self.batches.registry()
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        self.batches.dispatcher()
    }
}
