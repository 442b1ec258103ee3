use log::{debug, warn};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::endpoint::{Endpoint, SelectorKey};
use crate::executor::{job, Job, Rejected};
use crate::manager::{Attachment, SelectorManager};
use crate::selector::producer::SelectorProducer;
use crate::selector::strategy::ExecuteProduceConsume;
use crate::selector::update::{ClosedSet, ConnectState, DumpReply, Kind, Latch};

pub(crate) mod producer;
pub(crate) mod strategy;
pub(crate) mod update;

pub use update::{SelectorUpdate, Update};

pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

const DUMP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("selector already started")]
    AlreadyStarted,
    #[error("selector loop failed to start within {0:?}")]
    StartTimeout(Duration),
    #[error("selector production rejected by the executor")]
    RejectedProduction,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Follow a zero-key wake with a non-blocking poll. Some platforms wake
    /// without readiness and would otherwise spin without progress.
    pub force_select_now: bool,
    /// Bounded patience for the start and shutdown latches.
    pub stop_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            force_select_now: cfg!(windows),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Counter snapshot returned by [`ManagedSelector::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectorStats {
    pub selects: u64,
    pub wakeups: u64,
    pub updates: u64,
    pub keys: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) selects: AtomicU64,
    pub(crate) wakeups: AtomicU64,
    pub(crate) updates: AtomicU64,
}

pub(crate) struct QueueState {
    pub(crate) updates: VecDeque<Update>,
    pub(crate) selecting: bool,
    pub(crate) waker: Option<Arc<mio::Waker>>,
}

pub(crate) struct Inner {
    pub(crate) id: usize,
    pub(crate) manager: Arc<dyn SelectorManager>,
    pub(crate) queue: Mutex<QueueState>,
    pub(crate) started: AtomicBool,
    launched: AtomicBool,
    pub(crate) keys: AtomicUsize,
    pub(crate) counters: Counters,
    pub(crate) config: SelectorConfig,
}

impl Inner {
    pub(crate) fn submit(&self, update: Update) {
        let waker = {
            let mut queue = self.queue.lock();
            queue.updates.push_back(update);
            if queue.selecting {
                // Clearing the flag here coalesces concurrent submitters
                // into a single wakeup.
                queue.selecting = false;
                queue.waker.clone()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            debug!("wakeup on submit, selector {}", self.id);
            self.wake(&waker);
        }
    }

    /// Queue-jumping submit: the update lands ahead of the queued backlog,
    /// so it observes selector state from before that backlog applies.
    /// Wakes a parked loop unconditionally.
    pub(crate) fn submit_front(&self, update: Update) {
        let waker = {
            let mut queue = self.queue.lock();
            queue.updates.push_front(update);
            queue.selecting = false;
            queue.waker.clone()
        };
        if let Some(waker) = waker {
            debug!("wakeup on priority submit, selector {}", self.id);
            self.wake(&waker);
        }
    }

    pub(crate) fn wakeup(&self) {
        let waker = {
            let mut queue = self.queue.lock();
            if queue.selecting {
                queue.selecting = false;
                queue.waker.clone()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            debug!("wakeup, selector {}", self.id);
            self.wake(&waker);
        }
    }

    pub(crate) fn wake(&self, waker: &mio::Waker) {
        self.counters.wakeups.fetch_add(1, Ordering::Relaxed);
        if let Err(cause) = waker.wake() {
            warn!("selector {} wakeup failed: {cause}", self.id);
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// Wraps one OS readiness multiplexer and runs its select loop, applying
/// queued mutations between waits and dispatching readiness to the
/// registered endpoints. All methods are thread-safe; the OS handle itself
/// is only ever touched by the loop thread.
#[derive(Clone)]
pub struct ManagedSelector {
    pub(crate) inner: Arc<Inner>,
}

impl ManagedSelector {
    pub fn new(manager: Arc<dyn SelectorManager>, id: usize) -> Self {
        Self::with_config(manager, id, SelectorConfig::default())
    }

    pub fn with_config(
        manager: Arc<dyn SelectorManager>,
        id: usize,
        config: SelectorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                manager,
                queue: Mutex::new(QueueState {
                    updates: VecDeque::new(),
                    selecting: false,
                    waker: None,
                }),
                started: AtomicBool::new(false),
                launched: AtomicBool::new(false),
                keys: AtomicUsize::new(0),
                counters: Counters::default(),
                config,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Opens the OS handle and hands the loop to the executor. Returns once
    /// the loop thread has confirmed it is running.
    pub fn start(&self) -> Result<(), SelectorError> {
        if self.inner.launched.swap(true, Ordering::AcqRel) {
            return Err(SelectorError::AlreadyStarted);
        }
        let poll = self.inner.manager.new_selector()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        let registry = Arc::new(poll.registry().try_clone()?);
        self.inner.queue.lock().waker = Some(waker);

        let producer = SelectorProducer::new(self.clone(), poll, registry);
        let strategy = ExecuteProduceConsume::new(producer, self.inner.manager.executor());
        let entry = job(move || strategy.produce());
        if let Err(Rejected(_)) = self.inner.manager.executor().execute(entry) {
            warn!("selector {} production rejected at start", self.inner.id);
            return Err(SelectorError::RejectedProduction);
        }

        let latch = Latch::new();
        self.submit(Update(Kind::Start(Arc::clone(&latch))));
        if !latch.wait_for(self.inner.config.stop_timeout) {
            return Err(SelectorError::StartTimeout(self.inner.config.stop_timeout));
        }
        debug!("selector {} started", self.inner.id);
        Ok(())
    }

    /// Closes all connections, then the remaining endpoints and the OS
    /// handle, each phase on the loop thread with bounded patience.
    /// Idempotent: only the call that observes the running state stops.
    pub fn stop(&self) {
        self.stop_with(None)
    }

    pub(crate) fn stop_with(&self, closed: Option<ClosedSet>) {
        if self
            .inner
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let timeout = self.inner.config.stop_timeout;

        let latch = Latch::new();
        self.submit(Update(Kind::CloseConnections {
            closed,
            latch: Arc::clone(&latch),
        }));
        if !latch.wait_for(timeout) {
            warn!("selector {} close-connections timed out", self.inner.id);
        }

        let latch = Latch::new();
        self.submit(Update(Kind::StopSelector(Arc::clone(&latch))));
        if !latch.wait_for(timeout) {
            warn!("selector {} stop timed out", self.inner.id);
        }
        debug!("selector {} stopped", self.inner.id);
    }

    /// Enqueues a mutation to be applied between OS waits. Non-blocking and
    /// thread-safe; wakes the loop only when it is parked in the wait.
    pub fn submit(&self, update: Update) {
        debug!("queued {:?} on selector {}", update, self.inner.id);
        self.inner.submit(update);
    }

    /// Registers a listening channel; accepted channels are drained to
    /// [`SelectorManager::accepted`].
    pub fn register_acceptor(&self, listener: TcpListener) {
        self.submit(Update(Kind::Acceptor(listener)));
    }

    /// Hands an externally accepted channel to this selector. Endpoint
    /// construction happens on an executor thread, never on the loop.
    pub fn accept(&self, channel: TcpStream, attachment: Attachment) {
        self.inner.manager.on_accepting(&channel);
        self.submit(Update(Kind::Accept {
            channel,
            attachment,
        }));
    }

    /// Takes over an initiated non-blocking connect. The configured connect
    /// timeout starts now; whichever of readiness and timeout wins, the
    /// other side is a no-op.
    pub fn connect(&self, channel: TcpStream, attachment: Attachment) {
        let connect = ConnectState::new(channel, attachment);
        ConnectState::arm_timeout(&connect, self);
        self.submit(Update(Kind::Connect(connect)));
    }

    /// Schedules removal of an endpoint's registration and delivery of its
    /// closed notifications.
    pub fn destroy_end_point(&self, token: Token) {
        self.inner.wakeup();
        self.submit(Update(Kind::Destroy(token)));
    }

    /// Number of currently registered keys. Diagnostic only.
    pub fn key_count(&self) -> usize {
        self.inner.keys.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SelectorStats {
        SelectorStats {
            selects: self.inner.counters.selects.load(Ordering::Relaxed),
            wakeups: self.inner.counters.wakeups.load(Ordering::Relaxed),
            updates: self.inner.counters.updates.load(Ordering::Relaxed),
            keys: self.key_count(),
        }
    }

    pub(crate) fn manager(&self) -> &Arc<dyn SelectorManager> {
        &self.inner.manager
    }

    /// Dispatches through the manager's executor; a rejected job gets its
    /// rejection hook so owned channels are released, not leaked.
    pub(crate) fn execute(&self, job: Box<dyn Job>) {
        if let Err(Rejected(job)) = self.inner.manager.executor().execute(job) {
            debug!("job rejected by executor on selector {}", self.inner.id);
            job.rejected();
        }
    }

    pub(crate) fn create_endpoint(
        &self,
        channel: TcpStream,
        key: SelectorKey,
        attachment: Attachment,
    ) -> io::Result<Arc<dyn Endpoint>> {
        let manager = &self.inner.manager;
        let token = key.token();
        let endpoint = manager.new_endpoint(channel, self, key)?;
        let connection = manager.new_connection(&endpoint, attachment)?;
        endpoint.set_connection(Arc::clone(&connection));
        self.submit(Update(Kind::Attach {
            token,
            endpoint: Arc::clone(&endpoint),
        }));
        endpoint.on_open();
        manager.endpoint_opened(&endpoint);
        manager.connection_opened(&connection);
        debug!("created endpoint at {token:?}");
        Ok(endpoint)
    }

    /// Writes a diagnostic snapshot: the pending updates, then the key
    /// listing fetched from the loop thread with bounded patience.
    pub fn dump<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let pending: Vec<String> = {
            let queue = self.inner.queue.lock();
            queue.updates.iter().map(|u| format!("{u:?}")).collect()
        };
        let updates_at = now_rfc3339();

        // The key request jumps the backlog so the listing pairs with the
        // update snapshot taken just above.
        let reply = DumpReply::new();
        self.inner
            .submit_front(Update(Kind::DumpKeys(Arc::clone(&reply))));
        let keys = reply.wait_for(DUMP_TIMEOUT);
        let keys_at = now_rfc3339();

        writeln!(out, "selector {} updates @ {updates_at}", self.inner.id)?;
        for update in &pending {
            writeln!(out, "  {update}")?;
        }
        match keys {
            Some(keys) => {
                writeln!(out, "selector {} keys @ {keys_at}", self.inner.id)?;
                for key in keys {
                    writeln!(out, "  {key}")?;
                }
            }
            None => writeln!(out, "no dump keys retrieved")?,
        }
        Ok(())
    }
}

impl fmt::Debug for ManagedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSelector")
            .field("id", &self.inner.id)
            .field("keys", &self.key_count())
            .field("pending_updates", &self.inner.queue.lock().updates.len())
            .finish()
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Connection;
    use crate::executor::Executor;
    use crate::scheduler::Scheduler;

    struct IdleManager;

    impl SelectorManager for IdleManager {
        fn executor(&self) -> Arc<dyn Executor> {
            unimplemented!("not used by these tests")
        }

        fn scheduler(&self) -> Arc<dyn Scheduler> {
            unimplemented!("not used by these tests")
        }

        fn new_endpoint(
            &self,
            _channel: TcpStream,
            _selector: &ManagedSelector,
            _key: SelectorKey,
        ) -> io::Result<Arc<dyn Endpoint>> {
            unimplemented!("not used by these tests")
        }

        fn new_connection(
            &self,
            _endpoint: &Arc<dyn Endpoint>,
            _attachment: Attachment,
        ) -> io::Result<Arc<dyn Connection>> {
            unimplemented!("not used by these tests")
        }

        fn accepted(&self, _channel: TcpStream) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn default_config() {
        let config = SelectorConfig::default();
        assert_eq!(config.force_select_now, cfg!(windows));
        assert_eq!(config.stop_timeout, Duration::from_secs(5));
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let selector = ManagedSelector::new(Arc::new(IdleManager), 3);
        // Must return without blocking on latches that were never armed.
        selector.stop();
        assert_eq!(selector.key_count(), 0);
    }

    #[derive(Debug)]
    struct Noop;

    impl SelectorUpdate for Noop {
        fn update(&mut self, _registry: &mio::Registry) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn submit_before_start_queues_without_waking() {
        let selector = ManagedSelector::new(Arc::new(IdleManager), 0);
        selector.submit(Update::custom(Noop));
        selector.submit(Update::custom(Noop));
        assert_eq!(selector.stats().wakeups, 0);
        assert_eq!(selector.inner.queue.lock().updates.len(), 2);
    }

    #[test]
    fn dump_request_jumps_the_queue() {
        let selector = ManagedSelector::new(Arc::new(IdleManager), 0);
        selector.submit(Update::custom(Noop));
        selector.submit(Update::custom(Noop));

        let reply = DumpReply::new();
        selector
            .inner
            .submit_front(Update(Kind::DumpKeys(Arc::clone(&reply))));

        let queue = selector.inner.queue.lock();
        assert_eq!(queue.updates.len(), 3);
        assert!(matches!(
            queue.updates.front(),
            Some(Update(Kind::DumpKeys(_)))
        ));
    }

    #[test]
    fn debug_shows_id_and_keys() {
        let selector = ManagedSelector::new(Arc::new(IdleManager), 7);
        let text = format!("{selector:?}");
        assert!(text.contains("id: 7"));
        assert!(text.contains("keys: 0"));
    }
}
