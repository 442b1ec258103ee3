use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::trace;
use std::fmt;
use std::thread::{self, JoinHandle};

/// A unit of work produced by the selector and run on an executor thread.
pub trait Job: Send {
    fn run(self: Box<Self>);

    /// Invoked in place of [`Job::run`] when the executor rejects the job.
    /// Jobs that own a channel or endpoint must release it here.
    fn rejected(self: Box<Self>) {}
}

struct FnJob<F>(F);

impl<F: FnOnce() + Send> Job for FnJob<F> {
    fn run(self: Box<Self>) {
        (self.0)()
    }
}

pub fn job<F>(f: F) -> Box<dyn Job>
where
    F: FnOnce() + Send + 'static,
{
    Box::new(FnJob(f))
}

/// Returned by [`Executor::execute`] when the job was not accepted; carries
/// the job back so the caller can run it inline or let it release its
/// resources.
pub struct Rejected(pub Box<dyn Job>);

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

/// Fire-and-forget job dispatch. Implementations may reject when saturated
/// and must be safe to call from any thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Box<dyn Job>) -> Result<(), Rejected>;
}

/// Fixed pool of worker threads fed from a bounded queue. A full queue
/// rejects instead of blocking the submitter.
pub struct ThreadPool {
    sender: Sender<Box<dyn Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads: usize, queue: usize) -> Self {
        assert!(threads > 0, "thread pool needs at least one worker");
        let (sender, receiver) = bounded::<Box<dyn Job>>(queue);
        let workers = (0..threads)
            .map(|index| {
                let receiver: Receiver<Box<dyn Job>> = receiver.clone();
                thread::Builder::new()
                    .name(format!("selector-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job.run();
                        }
                        trace!("worker exiting");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        Self { sender, workers }
    }

    /// Closes the queue and waits for the workers to drain it.
    pub fn join(self) {
        let Self { sender, workers } = self;
        drop(sender);
        for worker in workers {
            worker.join().ok();
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Box<dyn Job>) -> Result<(), Rejected> {
        self.sender.try_send(job).map_err(|error| match error {
            TrySendError::Full(job) | TrySendError::Disconnected(job) => Rejected(job),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pool_runs_jobs() {
        let pool = ThreadPool::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.execute(job(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    struct ClosingJob {
        ran: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    impl Job for ClosingJob {
        fn run(self: Box<Self>) {
            self.ran.store(true, Ordering::SeqCst);
        }

        fn rejected(self: Box<Self>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn saturated_pool_rejects() {
        let pool = ThreadPool::new(1, 1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);

        // Occupy the single worker.
        pool.execute(job(move || {
            gate_rx.recv().ok();
        }))
        .unwrap();
        // Fill the queue. The worker may have already picked up the first
        // job, so two enqueues guarantee saturation.
        let mut rejections = 0;
        let ran = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        for _ in 0..3 {
            let probe = Box::new(ClosingJob {
                ran: ran.clone(),
                closed: closed.clone(),
            });
            if let Err(Rejected(job)) = pool.execute(probe) {
                rejections += 1;
                job.rejected();
            }
        }
        assert!(rejections >= 1);
        assert!(closed.load(Ordering::SeqCst));

        gate_tx.send(()).unwrap();
        pool.join();
    }

    #[test]
    fn join_drains_queued_jobs() {
        let pool = ThreadPool::new(1, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = counter.clone();
            pool.execute(job(move || {
                std::thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
