use log::trace;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub type TimerTask = Box<dyn FnOnce() + Send>;

/// Monotonic one-shot timer source.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// Cancellation handle for a scheduled task. Cancelling and firing race
/// through a single compare-and-set, so exactly one side wins.
#[derive(Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
}

impl TimerHandle {
    /// True if the task was cancelled before it fired.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// Instant plus a sequence number so equal deadlines stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerAt {
    when: Instant,
    seq: u64,
}

struct TimerEntry {
    state: Arc<AtomicU8>,
    task: TimerTask,
}

struct TimerState {
    queue: BTreeMap<TimerAt, TimerEntry>,
    sequence: u64,
    shutdown: bool,
}

struct TimerShared {
    timers: Mutex<TimerState>,
    cond: Condvar,
}

/// Dedicated timer thread: sleeps until the earliest deadline, fires due
/// tasks outside the lock, exits on drop.
pub struct TimerThread {
    shared: Arc<TimerShared>,
    thread: Option<JoinHandle<()>>,
}

impl TimerThread {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            timers: Mutex::new(TimerState {
                queue: BTreeMap::new(),
                sequence: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("selector-scheduler".into())
                .spawn(move || Self::run(shared))
                .expect("failed to spawn scheduler thread")
        };
        Self {
            shared,
            thread: Some(thread),
        }
    }

    fn run(shared: Arc<TimerShared>) {
        let mut due: Vec<TimerEntry> = Vec::new();
        loop {
            {
                let mut state = shared.timers.lock();
                loop {
                    if state.shutdown {
                        return;
                    }
                    let now = Instant::now();
                    while let Some(entry) = state.queue.first_entry() {
                        if entry.key().when > now {
                            break;
                        }
                        let (_, timer) = entry.remove_entry();
                        due.push(timer);
                    }
                    if !due.is_empty() {
                        break;
                    }
                    match state.queue.first_key_value().map(|(at, _)| at.when) {
                        Some(when) => {
                            let timeout = when.saturating_duration_since(now);
                            let _ = shared.cond.wait_for(&mut state, timeout);
                        }
                        None => shared.cond.wait(&mut state),
                    }
                }
            }
            for entry in due.drain(..) {
                if entry
                    .state
                    .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    (entry.task)();
                } else {
                    trace!("skipping cancelled timer");
                }
            }
        }
    }
}

impl Default for TimerThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TimerThread {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let state = Arc::new(AtomicU8::new(PENDING));
        let handle = TimerHandle {
            state: Arc::clone(&state),
        };
        {
            let mut timers = self.shared.timers.lock();
            let at = TimerAt {
                when: Instant::now() + delay,
                seq: timers.sequence,
            };
            timers.sequence = timers.sequence.wrapping_add(1);
            timers.queue.insert(at, TimerEntry { state, task });
        }
        self.shared.cond.notify_one();
        handle
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shared.timers.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn timer_fires() {
        let scheduler = TimerThread::new();
        let (tx, rx) = mpsc::channel();
        scheduler.schedule(
            Duration::from_millis(20),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let scheduler = TimerThread::new();
        let (tx, rx) = mpsc::channel();
        for (delay, tag) in [(60u64, 3), (20, 1), (40, 2)] {
            let tx = tx.clone();
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || {
                    tx.send(tag).unwrap();
                }),
            );
        }
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn cancel_before_fire() {
        let scheduler = TimerThread::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = {
            let fired = fired.clone();
            scheduler.schedule(
                Duration::from_millis(100),
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        assert!(handle.cancel());
        // A second cancel lost the race against the first.
        assert!(!handle.cancel());
        thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_reports_loss() {
        let scheduler = TimerThread::new();
        let (tx, rx) = mpsc::channel();
        let handle = scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!handle.cancel());
    }

    #[test]
    fn drop_stops_the_thread() {
        let scheduler = TimerThread::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            scheduler.schedule(
                Duration::from_secs(60),
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        drop(scheduler);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
