use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use crate::error::JobError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Fixed-size thread pool that maps tasks to results through `handler`.
///
/// Both channels are sized to hold every task of a batch, so neither
/// submission nor result delivery ever blocks. Tearing the pool down lets
/// running tasks finish and drops the ones still queued.
pub struct WorkerPool<T, R> {
    task_sender: Option<Sender<T>>,
    result_receiver: Receiver<R>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl<T, R> WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Spawns `worker_count` threads (at least one) for a batch of at most
    /// `capacity` tasks.
    pub fn new<F>(worker_count: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(usize, T) -> R + Send + Sync + 'static,
    {
        let worker_count = worker_count.max(1);
        let capacity = capacity.max(1);
        let (task_sender, task_receiver) = bounded::<T>(capacity);
        let (result_sender, result_receiver) = bounded::<R>(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(handler);

        let workers = (0..worker_count)
            .map(|worker_id| {
                let task_rx = task_receiver.clone();
                let result_tx = result_sender.clone();
                let shutdown_flag = Arc::clone(&shutdown);
                let handler = Arc::clone(&handler);
                thread::spawn(move || {
                    run_worker(worker_id, task_rx, result_tx, shutdown_flag, handler.as_ref())
                })
            })
            .collect();

        debug!("Started {} page workers", worker_count);

        Self {
            task_sender: Some(task_sender),
            result_receiver,
            workers,
            shutdown,
        }
    }

    pub fn submit(&self, task: T) -> Result<(), JobError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(JobError::Worker("worker pool is shut down".to_string()));
        }
        match &self.task_sender {
            Some(sender) => sender
                .send(task)
                .map_err(|_| JobError::Worker("task channel closed".to_string())),
            None => Err(JobError::Worker("task channel closed".to_string())),
        }
    }

    /// Waits up to `timeout` for the next finished result.
    pub fn recv_result_timeout(&self, timeout: Duration) -> Result<R, RecvTimeoutError> {
        self.result_receiver.recv_timeout(timeout)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Closes the task queue and joins every worker.
    pub fn wait(mut self) {
        self.task_sender.take();

        for (i, worker) in std::mem::take(&mut self.workers).into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Page worker {} panicked: {:?}", i, e);
            }
        }
        debug!("All page workers have stopped");
    }
}

fn run_worker<T, R, F>(
    worker_id: usize,
    task_receiver: Receiver<T>,
    result_sender: Sender<R>,
    shutdown: Arc<AtomicBool>,
    handler: &F,
) where
    F: Fn(usize, T) -> R,
{
    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Page worker {} received shutdown signal", worker_id);
            break;
        }

        match task_receiver.recv_timeout(POLL_INTERVAL) {
            Ok(task) => {
                let result = handler(worker_id, task);
                if result_sender.send(result).is_err() {
                    debug!("Page worker {} result channel closed", worker_id);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
