//! Named background threads with a stop channel.

use crate::error::{CohortError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::JoinHandle;

/// A running worker. Dropping the handle stops and joins it.
pub struct WorkerHandle<T> {
    name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> WorkerHandle<T> {
    /// Spawn `f` on a named thread; it receives the stop channel.
    pub fn spawn<F>(name: impl Into<String>, f: F) -> Result<Self>
    where
        F: FnOnce(Receiver<()>) -> T + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = bounded(1);
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || f(stop_rx))?;

        Ok(Self {
            name,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl<T> WorkerHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal the worker and wait for it; returns what the worker returned.
    pub fn stop(mut self) -> Result<T> {
        self.signal();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CohortError::WorkerPanicked(self.name.clone())),
            None => Err(CohortError::WorkerPanicked(self.name.clone())),
        }
    }

    fn signal(&mut self) {
        if let Some(stop) = self.stop.take() {
            // A full channel already carries a stop; a closed one means the
            // worker is gone.
            let _ = stop.try_send(());
        }
    }
}

impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
