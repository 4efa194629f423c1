use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Worker pool backing `EventLoop::add_work`, filesystem requests and DNS.
///
/// Workers are spawned lazily, one per submitted job, up to the configured
/// size; they exit when the loop (and with it the job channel) is dropped.
pub(crate) struct ThreadPool {
    tx: Option<Sender<Job>>,
    rx: Receiver<Job>,
    workers: Vec<thread::JoinHandle<()>>,
    size: usize,
}

impl ThreadPool {
    pub(crate) fn new(size: usize) -> ThreadPool {
        let (tx, rx) = unbounded();
        ThreadPool {
            tx: Some(tx),
            rx,
            workers: Vec::new(),
            size: size.max(1),
        }
    }

    pub(crate) fn execute(&mut self, job: Job) {
        if self.workers.len() < self.size {
            let rx = self.rx.clone();
            let id = self.workers.len();
            let handle = thread::Builder::new()
                .name(format!("evio-worker-{}", id))
                .spawn(move || worker_loop(rx));
            match handle {
                Ok(handle) => self.workers.push(handle),
                // Out of threads; existing workers (if any) still drain the
                // queue, otherwise run the job on the caller.
                Err(e) => {
                    log::warn!("failed to spawn worker thread: {}", e);
                    if self.workers.is_empty() {
                        job();
                        return;
                    }
                }
            }
        }

        if let Some(tx) = &self.tx {
            let _ = tx.send(job);
        }
    }
}

fn worker_loop(rx: Receiver<Job>) {
    trace!("worker thread started");
    while let Ok(job) = rx.recv() {
        job();
    }
    trace!("worker thread exiting");
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Disconnect the channel so workers drain outstanding jobs and exit.
        drop(self.tx.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
