use log::{debug, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Registry, Token};
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::endpoint::{Endpoint, SelectorKey};
use crate::executor::Job;
use crate::manager::Attachment;
use crate::scheduler::TimerHandle;
use crate::selector::ManagedSelector;

/// A deferred selector mutation applied on the loop thread between OS
/// waits. Errors are logged at warn and never stop the loop.
pub trait SelectorUpdate: Send + fmt::Debug {
    fn update(&mut self, registry: &Registry) -> io::Result<()>;
}

pub(crate) type ClosedSet = Arc<Mutex<HashSet<usize>>>;

/// A pending selector mutation. Built-in mutations are created through
/// [`ManagedSelector`] methods; arbitrary ones through [`Update::custom`].
pub struct Update(pub(crate) Kind);

pub(crate) enum Kind {
    Start(Arc<Latch>),
    Acceptor(TcpListener),
    Accept {
        channel: TcpStream,
        attachment: Attachment,
    },
    Connect(Arc<ConnectState>),
    Attach {
        token: Token,
        endpoint: Arc<dyn Endpoint>,
    },
    Destroy(Token),
    Cancel(Token),
    CloseConnections {
        closed: Option<ClosedSet>,
        latch: Arc<Latch>,
    },
    StopSelector(Arc<Latch>),
    DumpKeys(Arc<DumpReply>),
    Custom(Box<dyn SelectorUpdate>),
}

impl Update {
    pub fn custom<U: SelectorUpdate + 'static>(update: U) -> Self {
        Update(Kind::Custom(Box::new(update)))
    }
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Kind::Start(_) => f.write_str("Start"),
            Kind::Acceptor(_) => f.write_str("Acceptor"),
            Kind::Accept { .. } => f.write_str("Accept"),
            Kind::Connect(connect) => write!(f, "{connect:?}"),
            Kind::Attach { token, .. } => write!(f, "Attach({token:?})"),
            Kind::Destroy(token) => write!(f, "Destroy({token:?})"),
            Kind::Cancel(token) => write!(f, "Cancel({token:?})"),
            Kind::CloseConnections { .. } => f.write_str("CloseConnections"),
            Kind::StopSelector(_) => f.write_str("StopSelector"),
            Kind::DumpKeys(_) => f.write_str("DumpKeys"),
            Kind::Custom(update) => write!(f, "{update:?}"),
        }
    }
}

/// One-shot completion gate with a bounded wait.
pub(crate) struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn count_down(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

/// Carries the key listing out of a dump request.
pub(crate) struct DumpReply {
    keys: Mutex<Option<Vec<String>>>,
    cond: Condvar,
}

impl DumpReply {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            keys: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub(crate) fn fulfill(&self, keys: Vec<String>) {
        *self.keys.lock() = Some(keys);
        self.cond.notify_all();
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> Option<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut keys = self.keys.lock();
        while keys.is_none() {
            if self.cond.wait_until(&mut keys, deadline).timed_out() {
                break;
            }
        }
        keys.take()
    }
}

/// Shared record of one in-flight connect. Both the readiness side and the
/// timeout side race through [`ConnectState::failed`]; the atomic flag makes
/// the failure dispatch at-most-once.
pub(crate) struct ConnectState {
    channel: Mutex<Option<TcpStream>>,
    attachment: Mutex<Option<Attachment>>,
    token: Mutex<Option<Token>>,
    failed: AtomicBool,
    timeout: Mutex<Option<TimerHandle>>,
}

impl ConnectState {
    pub(crate) fn new(channel: TcpStream, attachment: Attachment) -> Arc<Self> {
        Arc::new(Self {
            channel: Mutex::new(Some(channel)),
            attachment: Mutex::new(Some(attachment)),
            token: Mutex::new(None),
            failed: AtomicBool::new(false),
            timeout: Mutex::new(None),
        })
    }

    /// Schedules the connect timeout. Armed at submission so the clock runs
    /// even while the update is still queued.
    pub(crate) fn arm_timeout(this: &Arc<Self>, selector: &ManagedSelector) {
        let delay = selector.manager().connect_timeout();
        let state = Arc::clone(this);
        let selector = selector.clone();
        let handle = selector.manager().scheduler().schedule(
            delay,
            Box::new(move || {
                let pending = state
                    .channel
                    .lock()
                    .as_ref()
                    .map(|channel| selector.manager().is_connection_pending(channel))
                    .unwrap_or(false);
                if pending {
                    debug!("channel timed out while connecting, closing it");
                    state.failed(
                        &selector,
                        io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
                    );
                }
            }),
        );
        *this.timeout.lock() = Some(handle);
    }

    pub(crate) fn set_token(&self, token: Token) {
        *self.token.lock() = Some(token);
    }

    pub(crate) fn take_channel(&self) -> Option<TcpStream> {
        self.channel.lock().take()
    }

    pub(crate) fn take_attachment(&self) -> Attachment {
        self.attachment
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(()))
    }

    pub(crate) fn with_channel<R>(&self, f: impl FnOnce(&TcpStream) -> R) -> Option<R> {
        self.channel.lock().as_ref().map(f)
    }

    pub(crate) fn with_channel_mut<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> Option<R> {
        self.channel.lock().as_mut().map(f)
    }

    /// True if the timeout was cancelled before it fired.
    pub(crate) fn cancel_timeout(&self) -> bool {
        match self.timeout.lock().take() {
            Some(handle) => handle.cancel(),
            None => false,
        }
    }

    pub(crate) fn failed(&self, selector: &ManagedSelector, cause: io::Error) {
        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(timeout) = self.timeout.lock().take() {
                timeout.cancel();
            }
            // Dropping the channel closes it.
            drop(self.channel.lock().take());
            let token = *self.token.lock();
            if let Some(token) = token {
                selector.submit(Update(Kind::Cancel(token)));
            }
            let attachment = self.take_attachment();
            warn!("connect failed: {cause}");
            selector.manager().connection_failed(cause, attachment);
        }
    }
}

impl fmt::Debug for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connect{{token={:?}, failed={}}}",
            *self.token.lock(),
            self.failed.load(Ordering::Relaxed)
        )
    }
}

/// Promotes a finished connect into an endpoint off the loop thread;
/// endpoint construction may run application code and must not block
/// production.
pub(crate) struct CreateEndPoint {
    pub(crate) selector: ManagedSelector,
    pub(crate) connect: Arc<ConnectState>,
    pub(crate) channel: TcpStream,
    pub(crate) key: SelectorKey,
}

impl Job for CreateEndPoint {
    fn run(self: Box<Self>) {
        let Self {
            selector,
            connect,
            channel,
            key,
        } = *self;
        let attachment = connect.take_attachment();
        if let Err(cause) = selector.create_endpoint(channel, key, attachment) {
            connect.failed(&selector, cause);
        }
    }

    fn rejected(self: Box<Self>) {
        let Self {
            selector, connect, ..
        } = *self;
        connect.failed(
            &selector,
            io::Error::new(io::ErrorKind::Other, "endpoint creation rejected"),
        );
    }
}

/// Builds the endpoint for an externally accepted channel.
pub(crate) struct AcceptJob {
    pub(crate) selector: ManagedSelector,
    pub(crate) channel: TcpStream,
    pub(crate) key: SelectorKey,
    pub(crate) attachment: Attachment,
    pub(crate) token: Token,
}

impl Job for AcceptJob {
    fn run(self: Box<Self>) {
        let Self {
            selector,
            channel,
            key,
            attachment,
            token,
        } = *self;
        match selector.create_endpoint(channel, key, attachment) {
            Ok(endpoint) => selector.manager().on_accepted(&endpoint),
            Err(cause) => {
                warn!("accepted channel promotion failed: {cause}");
                selector.manager().on_accept_failed(&cause);
                selector.submit(Update(Kind::Cancel(token)));
            }
        }
    }

    fn rejected(self: Box<Self>) {
        let Self {
            selector,
            channel,
            token,
            ..
        } = *self;
        drop(channel);
        let cause = io::Error::new(io::ErrorKind::Other, "endpoint creation rejected");
        selector.manager().on_accept_failed(&cause);
        selector.submit(Update(Kind::Cancel(token)));
    }
}

/// Delivers the closed notifications for a removed endpoint. Runs even when
/// rejected so the callbacks are never lost.
pub(crate) struct DestroyEndPoint {
    pub(crate) selector: ManagedSelector,
    pub(crate) endpoint: Arc<dyn Endpoint>,
}

impl DestroyEndPoint {
    fn notify(self) {
        debug!("destroyed endpoint");
        if let Some(connection) = self.endpoint.connection() {
            self.selector.manager().connection_closed(&connection);
        }
        self.selector.manager().endpoint_closed(&self.endpoint);
    }
}

impl Job for DestroyEndPoint {
    fn run(self: Box<Self>) {
        (*self).notify()
    }

    fn rejected(self: Box<Self>) {
        (*self).notify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn latch_releases_waiters() {
        let latch = Latch::new();
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait_for(Duration::from_secs(5)))
        };
        latch.count_down();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn latch_times_out() {
        let latch = Latch::new();
        assert!(!latch.wait_for(Duration::from_millis(20)));
    }

    #[test]
    fn dump_reply_times_out_empty() {
        let reply = DumpReply::new();
        assert!(reply.wait_for(Duration::from_millis(20)).is_none());
    }

    #[test]
    fn dump_reply_carries_keys() {
        let reply = DumpReply::new();
        reply.fulfill(vec!["a".into(), "b".into()]);
        assert_eq!(
            reply.wait_for(Duration::from_millis(20)),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[derive(Debug)]
    struct Named;

    impl SelectorUpdate for Named {
        fn update(&mut self, _registry: &Registry) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn custom_updates_keep_their_debug_name() {
        let update = Update::custom(Named);
        assert_eq!(format!("{update:?}"), "Named");
    }
}
