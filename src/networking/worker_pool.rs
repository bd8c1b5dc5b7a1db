/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A bounded pool of worker threads that run jobs without the submitter waiting for them.
//!
//! Used twice by a [`Node`](crate::node::Node): once to handle every inbound envelope as an
//! independent job, and once as the dispatch queue for fan-out sends.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::sync::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    name: &'static str,
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
}

impl WorkerPool {
    /// Spawn `workers` threads that share a queue of at most `capacity` pending jobs.
    pub fn new(name: &'static str, workers: usize, capacity: usize) -> WorkerPool {
        let (sender, receiver) = mpsc::sync_channel::<Job>(capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new((Mutex::new(0usize), Condvar::new()));

        let workers = (0..workers.max(1))
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                let in_flight = Arc::clone(&in_flight);
                thread::spawn(move || run_worker(receiver, in_flight))
            })
            .collect();

        WorkerPool {
            name,
            sender: Some(sender),
            workers,
            in_flight,
        }
    }

    /// Queue `job`. Never blocks: if the queue is full the job is dropped and `PoolError::Full` returned.
    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return Err(PoolError::Closed(self.name));
        };

        {
            let (count, _) = &*self.in_flight;
            *lock(count) += 1;
        }

        let result = match sender.try_send(Box::new(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::Full(self.name)),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Closed(self.name)),
        };

        if result.is_err() {
            finish_job(&self.in_flight);
        }
        result
    }

    /// Block until no job is queued or running, or until `timeout` passes. Returns whether the pool
    /// became idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (count, idle) = &*self.in_flight;
        let mut pending = lock(count);
        while *pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            pending = match idle.wait_timeout(pending, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel makes every worker return once the queue is drained.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn run_worker(receiver: Arc<Mutex<Receiver<Job>>>, in_flight: Arc<(Mutex<usize>, Condvar)>) {
    loop {
        let job = match lock(&receiver).recv() {
            Ok(job) => job,
            Err(_) => return,
        };
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("worker job panicked");
        }
        finish_job(&in_flight);
    }
}

fn finish_job(in_flight: &(Mutex<usize>, Condvar)) {
    let (count, idle) = in_flight;
    let mut pending = lock(count);
    *pending = pending.saturating_sub(1);
    if *pending == 0 {
        idle.notify_all();
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{0} queue is full")]
    Full(&'static str),

    #[error("{0} is shut down")]
    Closed(&'static str),
}
