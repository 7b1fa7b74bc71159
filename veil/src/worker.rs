//! Worker threads for deferred and passive work
//!
//! Every worker owns a bounded queue. Posting from the signal path never
//! blocks (`try_post`); a full queue hands the item back to the caller.
//! `flush` pushes a barrier through the queue and waits for it, which
//! guarantees every item posted before the call has finished running.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

enum Job<T> {
    Run(T),
    Barrier(mpsc::Sender<()>),
    Stop,
}

/// A single thread draining a bounded queue of `T`
pub struct Worker<T: Send + 'static> {
    name: String,
    tx: SyncSender<Job<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn a worker that feeds every posted item to `handler`
    pub fn spawn<F>(name: impl Into<String>, depth: usize, mut handler: F) -> std::io::Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let name = name.into();
        let (tx, rx): (SyncSender<Job<T>>, Receiver<Job<T>>) = mpsc::sync_channel(depth.max(1));

        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(job) = rx.recv() {
                match job {
                    Job::Run(item) => handler(item),
                    Job::Barrier(done) => {
                        let _ = done.send(());
                    }
                    Job::Stop => break,
                }
            }
        })?;

        debug!("worker {} started (depth {})", name, depth);
        Ok(Self {
            name,
            tx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `item` without blocking; returns it if the queue is full
    pub fn try_post(&self, item: T) -> Result<(), T> {
        match self.tx.try_send(Job::Run(item)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(Job::Run(item)))
            | Err(TrySendError::Disconnected(Job::Run(item))) => Err(item),
            Err(_) => unreachable!("only Run jobs are posted here"),
        }
    }

    /// Queue `item`, waiting for room
    pub fn post(&self, item: T) -> Result<(), T> {
        match self.tx.send(Job::Run(item)) {
            Ok(()) => Ok(()),
            Err(mpsc::SendError(Job::Run(item))) => Err(item),
            Err(_) => unreachable!("only Run jobs are posted here"),
        }
    }

    /// Wait until every item queued before this call has been handled
    ///
    /// Must not be called from the worker's own thread.
    pub fn flush(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.tx.send(Job::Barrier(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.recv();
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        let _ = self.tx.send(Job::Stop);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("worker {} exited by panic", self.name);
            }
        }
    }
}

/// One deferred worker per processor slot
pub struct DeferredPool<T: Send + 'static> {
    workers: Vec<Worker<T>>,
}

impl<T: Send + 'static> DeferredPool<T> {
    /// Spawn `count` workers (0 means one per available processor)
    pub fn spawn<F>(count: usize, depth: usize, handler: F) -> std::io::Result<Self>
    where
        F: Fn(T) + Send + Sync + Clone + 'static,
    {
        let count = if count == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            count
        };

        let workers = (0..count)
            .map(|cpu| Worker::spawn(format!("veil-dpc-{cpu}"), depth, handler.clone()))
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Post to the worker serving `cpu` without blocking
    pub fn try_post(&self, cpu: usize, item: T) -> Result<(), T> {
        if self.workers.is_empty() {
            return Err(item);
        }
        self.workers[cpu % self.workers.len()].try_post(item)
    }

    /// Barrier through every worker
    pub fn flush(&self) {
        for worker in &self.workers {
            worker.flush();
        }
    }
}
