//! Background execution of dataset operations on a bounded worker pool.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        mpsc::{self, Receiver, TryRecvError},
    },
};

use anyhow::anyhow;
use core_model::{MessagePreview, MessageSource};
use ingest::{GenerationOptions, GenerationReport, generate};
use rayon::{ThreadPool, ThreadPoolBuilder};
use search::{Filter, IndexOptions, IndexReport, SearchPage};
use tracing::error;

use crate::{dataset::Dataset, package::PackReport};

const LOST: &str = "task ended without a result";

/// Result handle of a submitted operation.
pub struct Task<T> {
    rx: Receiver<anyhow::Result<T>>,
    done: Option<anyhow::Result<T>>,
}

impl<T> Task<T> {
    /// Blocks until the operation finishes.
    pub fn wait(self) -> anyhow::Result<T> {
        match self.done {
            Some(result) => result,
            None => self.rx.recv().unwrap_or_else(|_| Err(anyhow!(LOST))),
        }
    }

    /// The result if the operation has finished, without blocking.
    pub fn try_get(&mut self) -> Option<&anyhow::Result<T>> {
        if self.done.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.done = Some(result),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => self.done = Some(Err(anyhow!(LOST))),
            }
        }
        self.done.as_ref()
    }
}

/// Fixed-size pool running dataset operations off the caller's thread.
///
/// Tasks run in submission order as workers free up. There is no
/// cancellation; a panicking task reports an error through its handle.
pub struct TaskPool {
    pool: ThreadPool,
}

impl TaskPool {
    pub fn new(workers: usize) -> anyhow::Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("mailidx-task-{i}"))
            .panic_handler(|_| error!("background task panicked"))
            .build()?;
        Ok(Self { pool })
    }

    pub fn submit<T, F>(&self, f: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.pool.spawn(move || {
            // the receiver may be gone; nobody is waiting then
            let _ = tx.send(f());
        });
        Task { rx, done: None }
    }

    pub fn open(&self, path: PathBuf) -> Task<Dataset> {
        self.submit(move || Dataset::open(path))
    }

    pub fn generate(
        &self,
        locations: Vec<PathBuf>,
        destination: PathBuf,
        source: Arc<dyn MessageSource>,
        options: GenerationOptions,
    ) -> Task<GenerationReport> {
        self.submit(move || generate(&locations, &destination, source.as_ref(), &options, &|_| {}))
    }

    pub fn export(&self, dataset: Arc<Dataset>, archive: PathBuf) -> Task<PackReport> {
        self.submit(move || dataset.export(&archive))
    }

    pub fn find(
        &self,
        dataset: Arc<Dataset>,
        page: usize,
        size: usize,
        filters: Vec<Filter>,
    ) -> Task<SearchPage> {
        self.submit(move || dataset.find(page, size, &filters))
    }

    pub fn search(
        &self,
        dataset: Arc<Dataset>,
        query: String,
        max_results: usize,
    ) -> Task<Vec<MessagePreview>> {
        self.submit(move || dataset.search(&query, max_results))
    }

    pub fn regenerate_index(
        &self,
        dataset: Arc<Dataset>,
        options: IndexOptions,
    ) -> Task<IndexReport> {
        self.submit(move || dataset.regenerate_index(&options, &|_| {}))
    }
}
