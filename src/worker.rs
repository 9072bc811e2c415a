//! Bounded background thread pool for deferred, fire-and-forget work:
//! JPEG reaping, cross-session healing dispatch, eviction sweeps.
//!
//! The original spins up a bare `threading.Thread(daemon=True)` at each
//! of these three call sites independently. The Design Notes ask for a
//! single long-lived pool per concern instead (see DESIGN.md Open
//! Question decisions) — this is that pool: a small fixed-size set of
//! workers fed by an `mpsc` channel, sized for background bookkeeping
//! rather than the CPU-bound compression `rayon` already owns.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct BackgroundPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl BackgroundPool {
    /// `workers` is clamped to at least 1.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = std::sync::Arc::new(parking_lot::Mutex::new(receiver));
        let handles = (0..workers)
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::spawn(move || loop {
                    let job = {
                        let rx = receiver.lock();
                        rx.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
            })
            .collect();
        Self {
            sender: Some(sender),
            workers: handles,
        }
    }

    /// Enqueue `job` for execution on a worker thread. Silently dropped
    /// if the pool has already been shut down.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for BackgroundPool {
    fn drop(&mut self) {
        self.sender = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
