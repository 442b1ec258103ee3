use mio::net::TcpStream;
use mio::Poll;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::{Connection, Endpoint, SelectorKey};
use crate::executor::Executor;
use crate::scheduler::Scheduler;
use crate::selector::{ManagedSelector, SelectorError};

/// Opaque payload carried through accept and connect and handed back to
/// [`SelectorManager::new_connection`] or
/// [`SelectorManager::connection_failed`].
pub type Attachment = Box<dyn Any + Send>;

/// The collaborator a selector drives: it supplies the executor, the timer
/// source and the endpoint/connection factories, and receives lifecycle
/// notifications. Callback defaults are no-ops.
pub trait SelectorManager: Send + Sync + 'static {
    fn executor(&self) -> Arc<dyn Executor>;

    fn scheduler(&self) -> Arc<dyn Scheduler>;

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(15)
    }

    /// Constructs the OS readiness primitive for a starting selector.
    fn new_selector(&self) -> io::Result<Poll> {
        Poll::new()
    }

    fn do_finish_connect(&self, channel: &TcpStream) -> io::Result<bool> {
        finish_connect(channel)
    }

    fn is_connection_pending(&self, channel: &TcpStream) -> bool {
        connection_pending(channel)
    }

    fn new_endpoint(
        &self,
        channel: TcpStream,
        selector: &ManagedSelector,
        key: SelectorKey,
    ) -> io::Result<Arc<dyn Endpoint>>;

    fn new_connection(
        &self,
        endpoint: &Arc<dyn Endpoint>,
        attachment: Attachment,
    ) -> io::Result<Arc<dyn Connection>>;

    /// Routes a channel drained from an acceptor. The callee owns the
    /// channel and is responsible for closing it on error.
    fn accepted(&self, channel: TcpStream) -> io::Result<()>;

    fn on_accepting(&self, _channel: &TcpStream) {}

    fn on_accepted(&self, _endpoint: &Arc<dyn Endpoint>) {}

    fn on_accept_failed(&self, _cause: &io::Error) {}

    fn connection_opened(&self, _connection: &Arc<dyn Connection>) {}

    fn connection_closed(&self, _connection: &Arc<dyn Connection>) {}

    fn connection_failed(&self, _cause: io::Error, _attachment: Attachment) {}

    fn endpoint_opened(&self, _endpoint: &Arc<dyn Endpoint>) {}

    fn endpoint_closed(&self, _endpoint: &Arc<dyn Endpoint>) {}

    /// Invoked when the OS wait fails fatally while the selector is running.
    fn on_select_failed(&self, _cause: &io::Error) {}
}

fn in_progress(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::NotConnected {
        return true;
    }
    #[cfg(unix)]
    if error.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    false
}

/// Checks whether a non-blocking connect has completed. `Ok(false)` means
/// the handshake is still in flight; a deferred socket error is surfaced as
/// `Err`.
pub fn finish_connect(channel: &TcpStream) -> io::Result<bool> {
    if let Some(cause) = channel.take_error()? {
        return Err(cause);
    }
    match channel.peer_addr() {
        Ok(_) => Ok(true),
        Err(cause) if in_progress(&cause) => Ok(false),
        Err(cause) => Err(cause),
    }
}

pub fn connection_pending(channel: &TcpStream) -> bool {
    matches!(channel.peer_addr(), Err(cause) if in_progress(&cause))
}

/// A set of selectors sharing one manager, addressed round-robin. Runtimes
/// shard channels over several selectors to spread wakeup load.
pub struct SelectorPool {
    selectors: Vec<ManagedSelector>,
    next: AtomicUsize,
}

impl SelectorPool {
    pub fn new(manager: Arc<dyn SelectorManager>, count: usize) -> Self {
        assert!(count > 0, "selector pool needs at least one shard");
        let selectors = (0..count)
            .map(|id| ManagedSelector::new(Arc::clone(&manager), id))
            .collect();
        Self {
            selectors,
            next: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) -> Result<(), SelectorError> {
        for selector in &self.selectors {
            selector.start()?;
        }
        Ok(())
    }

    /// Stops every shard. Connections shared across shards are closed only
    /// once, tracked through a set shared by all the close passes.
    pub fn stop(&self) {
        let closed = Arc::new(Mutex::new(HashSet::new()));
        for selector in &self.selectors {
            selector.stop_with(Some(Arc::clone(&closed)));
        }
    }

    pub fn choose(&self) -> &ManagedSelector {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.selectors.len();
        &self.selectors[index]
    }

    pub fn get(&self, index: usize) -> Option<&ManagedSelector> {
        self.selectors.get(index)
    }

    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManagedSelector> {
        self.selectors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener as StdTcpListener;
    use std::thread;

    struct NullManager;

    impl SelectorManager for NullManager {
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
    fn pool_round_robins() {
        let pool = SelectorPool::new(Arc::new(NullManager), 3);
        assert_eq!(pool.len(), 3);
        let first = pool.choose().id();
        let second = pool.choose().id();
        let third = pool.choose().id();
        let wrapped = pool.choose().id();
        assert_eq!(vec![first, second, third], vec![0, 1, 2]);
        assert_eq!(wrapped, 0);
        assert!(pool.get(3).is_none());
    }

    #[test]
    fn finish_connect_on_established_stream() -> io::Result<()> {
        let listener = StdTcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"x").ok();
            thread::sleep(Duration::from_millis(200));
        });

        let channel = TcpStream::connect(addr)?;
        let mut connected = false;
        for _ in 0..100 {
            if finish_connect(&channel)? {
                connected = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(connected);
        assert!(!connection_pending(&channel));
        server.join().unwrap();
        Ok(())
    }
}
