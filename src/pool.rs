//! Worker pool and round-robin rotation.
//!
//! The pool spawns every worker up front, in index order. That order is the
//! rotation used both to hand out input records and to collect output, and
//! it only ever changes by removing workers.

use crate::config::JoinConfig;
use crate::error::Result;
use crate::worker::{Worker, WorkerInput, WorkerOutput, WorkerProcess};
use tracing::info;

/// An ordered ring with a cursor pointing at the item due next.
///
/// Removal is a stable left shift, so the relative order of the remaining
/// items never changes and the item after a removed one becomes due.
#[derive(Debug)]
pub struct Rotation<T> {
    items: Vec<T>,
    cursor: usize,
}

impl<T> Rotation<T> {
    /// Create a rotation starting at the first item.
    pub fn new(items: Vec<T>) -> Self {
        Self { items, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Position of the item due next.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The item due next, if any.
    pub fn current(&self) -> Option<&T> {
        self.items.get(self.cursor)
    }

    pub fn current_mut(&mut self) -> Option<&mut T> {
        self.items.get_mut(self.cursor)
    }

    /// Move the cursor to the following item, wrapping around.
    pub fn advance(&mut self) {
        if !self.items.is_empty() {
            self.cursor = (self.cursor + 1) % self.items.len();
        }
    }

    /// Remove the item due next; its successor becomes due.
    pub fn remove_current(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.remove(self.cursor))
    }

    /// Remove the item at `position`, shifting later items left.
    ///
    /// # Panics
    /// Panics if `position` is out of bounds.
    pub fn remove(&mut self, position: usize) -> T {
        let item = self.items.remove(position);
        if position < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.items.len() {
            self.cursor = 0;
        }
        item
    }

    /// Iterate in position order (not starting at the cursor).
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

impl<T> IntoIterator for Rotation<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    /// Consume the rotation in position order.
    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// A pool of spawned workers in rotation order.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<Worker>,
}

/// A pool split into the halves owned by the feeder, the joiner and the reaper.
#[derive(Debug)]
pub struct PoolParts {
    /// Stdin write ends, in rotation order.
    pub inputs: Rotation<WorkerInput>,
    /// Stdout/stderr read ends, in rotation order.
    pub outputs: Vec<WorkerOutput>,
    /// Process handles, in rotation order.
    pub processes: Vec<WorkerProcess>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers.
    ///
    /// If any spawn fails, the workers already started are closed and reaped
    /// before the error is returned.
    pub fn spawn(config: &JoinConfig) -> Result<Self> {
        info!(
            workers = config.workers.get(),
            command = %config.command_name(),
            serialize_stderr = config.serialize_stderr,
            "Initializing worker pool"
        );

        let mut workers = Vec::with_capacity(config.workers.get());
        for index in 0..config.workers.get() {
            workers.push(Worker::spawn(config, index)?);
        }

        info!(workers = workers.len(), "All workers started");
        Ok(Self { workers })
    }

    /// Hand out the worker endpoints, keeping rotation order in every part.
    pub fn split(self) -> PoolParts {
        let mut inputs = Vec::with_capacity(self.workers.len());
        let mut outputs = Vec::with_capacity(self.workers.len());
        let mut processes = Vec::with_capacity(self.workers.len());
        for worker in self.workers {
            inputs.push(worker.input);
            outputs.push(worker.output);
            processes.push(worker.process);
        }
        PoolParts {
            inputs: Rotation::new(inputs),
            outputs,
            processes,
        }
    }
}
