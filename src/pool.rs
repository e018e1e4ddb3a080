use std::{
    io, mem,
    panic::{self, AssertUnwindSafe},
    sync::{Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error};
use thiserror::Error;

#[derive(Error, Debug)]
pub(crate) enum Error {
    #[error("worker pool size must be at least 1")]
    InvalidSize,
    #[error("worker pool was already started")]
    AlreadyStarted,
    #[error("worker pool is not running")]
    NotRunning,
    #[error("could not spawn worker: {0}")]
    Spawn(#[from] io::Error),
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// What workers dequeue. `Exit` is the per-worker shutdown sentinel.
enum Message {
    Run(Job),
    Exit,
}

enum State {
    /// Created but not started, nothing can be scheduled yet.
    Idle,
    Running {
        sender: Sender<Message>,
        workers: Vec<JoinHandle<()>>,
    },
    /// Shut down; terminal.
    Stopped,
}

/// Fixed-size pool of long-lived worker threads draining a shared FIFO queue.
///
/// Each worker runs one job at a time to completion, so the pool size is the
/// upper bound of jobs executing concurrently. Jobs scheduled while all
/// workers are busy wait in the (unbounded) queue.
pub(crate) struct WorkerPool {
    size: usize,
    state: Mutex<State>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> Result<Self, Error> {
        if size < 1 {
            return Err(Error::InvalidSize);
        }

        Ok(Self {
            size,
            state: Mutex::new(State::Idle),
        })
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Spawns exactly `size` workers. Can only be called once.
    pub(crate) fn start(&self) -> Result<(), Error> {
        let mut state = self.lock();
        if !matches!(*state, State::Idle) {
            return Err(Error::AlreadyStarted);
        }

        let (sender, receiver) = crossbeam_channel::unbounded();

        // If spawning fails half-way, dropping the sender makes the already
        // spawned workers exit on their own.
        let workers = (0..self.size)
            .map(|id| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || work(id, receiver))
            })
            .collect::<io::Result<Vec<_>>>()?;

        debug!("Started {} workers", workers.len());
        *state = State::Running { sender, workers };
        Ok(())
    }

    /// Queues a job for execution by the next available worker.
    pub(crate) fn schedule<F>(&self, job: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        match &*self.lock() {
            // Sending only fails when no worker is left to receive.
            State::Running { sender, .. } => sender
                .send(Message::Run(Box::new(job)))
                .map_err(|_| Error::NotRunning),
            _ => Err(Error::NotRunning),
        }
    }

    /// Queues one exit sentinel per worker behind the pending jobs and waits
    /// for all workers to terminate. Jobs queued before this call are all
    /// executed; jobs scheduled after it are rejected.
    ///
    /// The state lock is held until every worker was joined, so concurrent
    /// callers all return after the pool is fully stopped.
    pub(crate) fn shutdown(&self) {
        let mut state = self.lock();

        if let State::Running { sender, workers } = mem::replace(&mut *state, State::Stopped) {
            debug!("Stopping {} workers", workers.len());

            workers.iter().for_each(|_| {
                // Only fails if all workers are already gone.
                let _ = sender.send(Message::Exit);
            });
            drop(sender);

            workers.into_iter().for_each(|worker| {
                if worker.join().is_err() {
                    error!("Worker returned unexpectedly");
                }
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Worker loop: dequeue, run, repeat until the exit sentinel shows up.
fn work(id: usize, receiver: Receiver<Message>) {
    loop {
        match receiver.recv() {
            Ok(Message::Run(job)) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Job panicked in worker {id}");
                }
            }
            Ok(Message::Exit) | Err(_) => break,
        }
    }
    debug!("Worker {id} exited");
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    #[test]
    fn invalid_size() {
        assert!(matches!(WorkerPool::new(0), Err(Error::InvalidSize)));
        assert_eq!(WorkerPool::new(1).unwrap().size(), 1);
    }

    #[test]
    fn lifecycle() {
        let pool = WorkerPool::new(2).unwrap();

        // Nothing can be scheduled before starting.
        assert!(matches!(pool.schedule(|| {}), Err(Error::NotRunning)));

        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(Error::AlreadyStarted)));
        assert!(pool.schedule(|| {}).is_ok());

        pool.shutdown();
        assert!(matches!(pool.schedule(|| {}), Err(Error::NotRunning)));
        assert!(matches!(pool.start(), Err(Error::AlreadyStarted)));

        // Shutting down twice is fine.
        pool.shutdown();
    }

    #[test]
    fn shutdown_never_started() {
        let pool = WorkerPool::new(4).unwrap();
        pool.shutdown();
        assert!(matches!(pool.schedule(|| {}), Err(Error::NotRunning)));
    }

    #[test]
    fn shutdown_drains_queue() {
        let pool = WorkerPool::new(3).unwrap();
        pool.start().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let done = Arc::clone(&done);
            pool.schedule(move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn bounded_concurrency() {
        let pool = WorkerPool::new(2).unwrap();
        pool.start().unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let running = Arc::clone(&running);
            let max = Arc::clone(&max);
            pool.schedule(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown();
        assert!(max.load(Ordering::SeqCst) <= 2);
        assert!(max.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn panicking_job() {
        let pool = WorkerPool::new(1).unwrap();
        pool.start().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        pool.schedule(|| panic!("boom")).unwrap();
        let _done = Arc::clone(&done);
        pool.schedule(move || {
            _done.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // The single worker survived the panic and ran the second job.
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
