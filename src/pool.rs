// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crossbeam_channel::{Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of OS worker threads.
///
/// Two enqueue modes: [`ThreadPool::execute`] queues without bound;
/// [`ThreadPool::execute_blocking`] suspends the caller until the queue
/// depth drops below the worker count, which is the backpressure primitive
/// feeding the feature-cooking pipeline and the evaluator.
pub struct ThreadPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queued: Arc<(Mutex<usize>, Condvar)>,
}

impl ThreadPool {
    /// Spawns `size` workers.
    #[must_use]
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0);

        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let queued = Arc::new((Mutex::new(0usize), Condvar::new()));

        let workers = (0..size)
            .map(|_| {
                let rx: Receiver<Job> = rx.clone();
                let queued = Arc::clone(&queued);
                std::thread::spawn(move || {
                    while let Ok(job) = rx.recv() {
                        {
                            let (count, signal) = &*queued;
                            if let Ok(mut count) = count.lock() {
                                *count = count.saturating_sub(1);
                            }
                            signal.notify_one();
                        }
                        job();
                    }
                })
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
            queued,
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a task without bound.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> crate::Result<()> {
        self.submit(Box::new(job))
    }

    /// Queues a task, suspending until the queue depth drops below the
    /// worker count.
    pub fn execute_blocking(&self, job: impl FnOnce() + Send + 'static) -> crate::Result<()> {
        {
            let (count, signal) = &*self.queued;
            let mut count = count
                .lock()
                .map_err(|_| crate::Error::Train("thread pool state poisoned".into()))?;
            while *count >= self.workers.len() {
                count = signal
                    .wait(count)
                    .map_err(|_| crate::Error::Train("thread pool state poisoned".into()))?;
            }
        }
        self.submit(Box::new(job))
    }

    fn submit(&self, job: Job) -> crate::Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(crate::Error::Train("enqueue on a stopped thread pool".into()));
        };

        {
            let (count, _) = &*self.queued;
            if let Ok(mut count) = count.lock() {
                *count += 1;
            }
        }

        tx.send(job)
            .map_err(|_| crate::Error::Train("enqueue on a stopped thread pool".into()))
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Closing the channel lets every worker drain and exit
        self.tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Resolves `--n_threads`: 0 means one worker per hardware thread.
#[must_use]
pub fn concurrency(n_threads: u32) -> usize {
    if n_threads == 0 {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    } else {
        n_threads as usize
    }
}
