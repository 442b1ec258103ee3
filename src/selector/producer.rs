use enum_as_inner::EnumAsInner;
use log::{debug, trace, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::{Endpoint, Ready, SelectorKey};
use crate::executor::Job;
use crate::selector::update::{
    AcceptJob, ClosedSet, ConnectState, CreateEndPoint, DestroyEndPoint, Kind, Update,
};
use crate::selector::{ManagedSelector, WAKE_TOKEN};

const EVENT_CAPACITY: usize = 1024;

#[derive(EnumAsInner)]
pub(crate) enum KeyAttachment {
    Acceptor(TcpListener),
    Connect(Arc<ConnectState>),
    Endpoint(Arc<dyn Endpoint>),
    /// Reserved while a worker builds the endpoint; events for it are
    /// dropped until the attach lands.
    Pending,
}

enum Selected {
    Dispatch(Arc<dyn Endpoint>),
    FinishConnect(Arc<ConnectState>),
    DrainAcceptor,
    Skip,
}

/// Pumps one selector: drain updates, wait on the OS, dispatch ready keys.
/// Owned by the execution strategy; only one thread runs it at a time.
pub(crate) struct SelectorProducer {
    selector: ManagedSelector,
    poll: Option<Poll>,
    registry: Arc<Registry>,
    events: Events,
    selected: VecDeque<(Token, Ready)>,
    cycle: Vec<Token>,
    entries: Slab<KeyAttachment>,
    updateable: VecDeque<Update>,
}

impl SelectorProducer {
    pub(crate) fn new(selector: ManagedSelector, poll: Poll, registry: Arc<Registry>) -> Self {
        Self {
            selector,
            poll: Some(poll),
            registry,
            events: Events::with_capacity(EVENT_CAPACITY),
            selected: VecDeque::new(),
            cycle: Vec::new(),
            entries: Slab::new(),
            updateable: VecDeque::new(),
        }
    }

    /// Yields at most one runnable per call; the ready-set cursor survives
    /// across calls so dispatch resumes where it left off. Returns `None`
    /// once the selector has stopped.
    pub(crate) fn produce(&mut self) -> Option<Box<dyn Job>> {
        loop {
            if let Some(task) = self.process_selected() {
                return Some(task);
            }
            self.process_updates();
            self.update_keys();
            if !self.select() {
                return None;
            }
        }
    }

    fn process_selected(&mut self) -> Option<Box<dyn Job>> {
        while let Some((token, ready)) = self.selected.pop_front() {
            let selected = match self.entries.get(token.0) {
                Some(KeyAttachment::Endpoint(endpoint)) => Selected::Dispatch(Arc::clone(endpoint)),
                Some(KeyAttachment::Connect(connect)) => {
                    Selected::FinishConnect(Arc::clone(connect))
                }
                Some(KeyAttachment::Acceptor(_)) => Selected::DrainAcceptor,
                Some(KeyAttachment::Pending) | None => Selected::Skip,
            };
            match selected {
                Selected::Dispatch(endpoint) => {
                    trace!("selected {ready:?} {token:?}");
                    self.cycle.push(token);
                    if let Some(task) = endpoint.on_selected(ready) {
                        return Some(task);
                    }
                }
                Selected::FinishConnect(connect) => self.process_connect(token, connect),
                Selected::DrainAcceptor => self.process_accept(token),
                Selected::Skip => trace!("ignoring event for vacant {token:?}"),
            }
        }
        None
    }

    fn process_accept(&mut self, token: Token) {
        let manager = Arc::clone(self.selector.manager());
        let Some(KeyAttachment::Acceptor(listener)) = self.entries.get_mut(token.0) else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((channel, peer)) => {
                    debug!("accepted {peer}");
                    if let Err(cause) = manager.accepted(channel) {
                        warn!("accepted channel refused: {cause}");
                    }
                }
                Err(ref cause) if cause.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref cause) if cause.kind() == io::ErrorKind::Interrupted => continue,
                Err(cause) => {
                    warn!("accept failed: {cause}");
                    manager.on_accept_failed(&cause);
                    break;
                }
            }
        }
    }

    fn process_connect(&mut self, token: Token, connect: Arc<ConnectState>) {
        let manager = Arc::clone(self.selector.manager());
        let finished = match connect.with_channel(|channel| manager.do_finish_connect(channel)) {
            Some(finished) => finished,
            // The timeout side already took the channel.
            None => return,
        };
        match finished {
            Ok(true) => {
                if connect.cancel_timeout() {
                    let Some(channel) = connect.take_channel() else {
                        return;
                    };
                    debug!("connected {token:?}");
                    self.entries[token.0] = KeyAttachment::Pending;
                    let key = SelectorKey::new(Arc::clone(&self.registry), token, true);
                    self.selector.execute(Box::new(CreateEndPoint {
                        selector: self.selector.clone(),
                        connect,
                        channel,
                        key,
                    }));
                } else {
                    connect.failed(
                        &self.selector,
                        io::Error::new(io::ErrorKind::TimedOut, "concurrent connect timeout"),
                    );
                }
            }
            Ok(false) => connect.failed(
                &self.selector,
                io::Error::new(io::ErrorKind::NotConnected, "connect did not complete"),
            ),
            Err(cause) => connect.failed(&self.selector, cause),
        }
    }

    fn process_updates(&mut self) {
        {
            let mut queue = self.selector.inner.queue.lock();
            std::mem::swap(&mut queue.updates, &mut self.updateable);
        }
        trace!("updateable {}", self.updateable.len());

        while let Some(update) = self.updateable.pop_front() {
            if self.poll.is_none() {
                self.updateable.clear();
                break;
            }
            self.selector
                .inner
                .counters
                .updates
                .fetch_add(1, Ordering::Relaxed);
            debug!("update {update:?}");
            if let Err(cause) = self.apply(update) {
                warn!("update failed: {cause}");
            }
        }

        // More updates may have arrived while draining: only then is an
        // extra wakeup needed so the imminent wait returns immediately.
        let waker = {
            let mut queue = self.selector.inner.queue.lock();
            queue.selecting = queue.updates.is_empty();
            if queue.selecting {
                None
            } else {
                queue.waker.clone()
            }
        };
        if let Some(waker) = waker {
            debug!("wakeup on updates, selector {}", self.selector.inner.id);
            self.selector.inner.wake(&waker);
        }
    }

    fn apply(&mut self, update: Update) -> io::Result<()> {
        match update.0 {
            Kind::Start(latch) => {
                self.selector.inner.started.store(true, Ordering::Release);
                latch.count_down();
                Ok(())
            }
            Kind::Acceptor(mut listener) => {
                let entry = self.entries.vacant_entry();
                let token = Token(entry.key());
                // A failed registration drops and thereby closes the listener.
                self.registry
                    .register(&mut listener, token, Interest::READABLE)?;
                entry.insert(KeyAttachment::Acceptor(listener));
                debug!("acceptor registered at {token:?}");
                self.sync_key_count();
                Ok(())
            }
            Kind::Accept {
                channel,
                attachment,
            } => {
                let token = Token(self.entries.insert(KeyAttachment::Pending));
                self.sync_key_count();
                let key = SelectorKey::new(Arc::clone(&self.registry), token, false);
                self.selector.execute(Box::new(AcceptJob {
                    selector: self.selector.clone(),
                    channel,
                    key,
                    attachment,
                    token,
                }));
                Ok(())
            }
            Kind::Connect(connect) => {
                let registry = Arc::clone(&self.registry);
                let entry = self.entries.vacant_entry();
                let token = Token(entry.key());
                match connect
                    .with_channel_mut(|channel| registry.register(channel, token, Interest::WRITABLE))
                {
                    Some(Ok(())) => {
                        connect.set_token(token);
                        entry.insert(KeyAttachment::Connect(Arc::clone(&connect)));
                        self.sync_key_count();
                    }
                    Some(Err(cause)) => connect.failed(&self.selector, cause),
                    // The timeout fired before the update was applied.
                    None => {}
                }
                Ok(())
            }
            Kind::Attach { token, endpoint } => {
                match self.entries.get_mut(token.0) {
                    Some(slot) if slot.is_pending() => {
                        *slot = KeyAttachment::Endpoint(Arc::clone(&endpoint));
                        // First arm of the interest set.
                        endpoint.update_key();
                    }
                    Some(_) => warn!("attach to occupied {token:?}"),
                    None => endpoint.close(),
                }
                Ok(())
            }
            Kind::Destroy(token) => {
                if self
                    .entries
                    .get(token.0)
                    .is_some_and(KeyAttachment::is_endpoint)
                {
                    if let Ok(endpoint) = self.entries.remove(token.0).into_endpoint() {
                        self.sync_key_count();
                        self.selector.execute(Box::new(DestroyEndPoint {
                            selector: self.selector.clone(),
                            endpoint,
                        }));
                    }
                }
                Ok(())
            }
            Kind::Cancel(token) => {
                let cancellable = self
                    .entries
                    .get(token.0)
                    .is_some_and(|attachment| attachment.is_pending() || attachment.is_connect());
                if cancellable {
                    self.entries.remove(token.0);
                    self.sync_key_count();
                }
                Ok(())
            }
            Kind::CloseConnections { closed, latch } => {
                self.close_connections(closed);
                latch.count_down();
                Ok(())
            }
            Kind::StopSelector(latch) => {
                self.stop_selector();
                latch.count_down();
                Ok(())
            }
            Kind::DumpKeys(reply) => {
                reply.fulfill(self.dump_keys());
                Ok(())
            }
            Kind::Custom(mut custom) => custom.update(&self.registry),
        }
    }

    fn close_connections(&mut self, closed: Option<ClosedSet>) {
        debug!(
            "closing {} connections on selector {}",
            self.entries.len(),
            self.selector.inner.id
        );
        for (_, attachment) in self.entries.iter() {
            if let KeyAttachment::Endpoint(endpoint) = attachment {
                match endpoint.connection() {
                    Some(connection) => {
                        let close = match &closed {
                            Some(closed) => {
                                closed.lock().insert(connection_identity(&connection))
                            }
                            None => true,
                        };
                        if close {
                            connection.close();
                        }
                    }
                    None => endpoint.close(),
                }
            }
        }
    }

    fn stop_selector(&mut self) {
        debug!("stopping selector {}", self.selector.inner.id);
        for attachment in self.entries.drain() {
            match attachment {
                KeyAttachment::Endpoint(endpoint) => endpoint.close(),
                KeyAttachment::Connect(connect) => connect.failed(
                    &self.selector,
                    io::Error::new(io::ErrorKind::NotConnected, "selector stopped"),
                ),
                KeyAttachment::Acceptor(listener) => drop(listener),
                KeyAttachment::Pending => {}
            }
        }
        self.sync_key_count();
        {
            let mut queue = self.selector.inner.queue.lock();
            queue.selecting = false;
            queue.waker = None;
        }
        // Dropping the handle closes the OS selector; produce() then exits.
        self.poll = None;
    }

    fn dump_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(key, attachment)| {
                let kind = match attachment {
                    KeyAttachment::Acceptor(_) => "acceptor".to_string(),
                    KeyAttachment::Connect(connect) => format!("{connect:?}"),
                    KeyAttachment::Endpoint(_) => "endpoint".to_string(),
                    KeyAttachment::Pending => "pending".to_string(),
                };
                format!("{:?} -> {kind}", Token(key))
            })
            .collect()
    }

    fn sync_key_count(&self) {
        self.selector
            .inner
            .keys
            .store(self.entries.len(), Ordering::Relaxed);
    }

    fn update_keys(&mut self) {
        // Only keys whose dispatch ran this cycle; each endpoint re-arms once.
        for token in std::mem::take(&mut self.cycle) {
            if let Some(endpoint) = self.entries.get(token.0).and_then(|a| a.as_endpoint()) {
                endpoint.update_key();
            }
        }
    }

    fn select(&mut self) -> bool {
        loop {
            let Some(poll) = self.poll.as_mut() else {
                return false;
            };
            trace!(
                "selector {} waiting with {} keys",
                self.selector.inner.id,
                self.entries.len()
            );
            match poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(cause) if cause.kind() == io::ErrorKind::Interrupted => {
                    if self.selector.inner.is_running() {
                        continue;
                    }
                    debug!("selector {} interrupted while stopping", self.selector.inner.id);
                    self.poll = None;
                    return false;
                }
                Err(cause) => {
                    self.fail_select(cause);
                    return false;
                }
            }
            if self.events.is_empty() && self.selector.inner.config.force_select_now {
                // Some platforms return a zero-key wake without readiness;
                // a non-blocking poll guarantees progress.
                let Some(poll) = self.poll.as_mut() else {
                    return false;
                };
                match poll.poll(&mut self.events, Some(Duration::ZERO)) {
                    Ok(()) => {}
                    Err(cause) if cause.kind() == io::ErrorKind::Interrupted => {}
                    Err(cause) => {
                        self.fail_select(cause);
                        return false;
                    }
                }
            }
            break;
        }

        {
            let mut queue = self.selector.inner.queue.lock();
            queue.selecting = false;
        }
        self.selector
            .inner
            .counters
            .selects
            .fetch_add(1, Ordering::Relaxed);

        self.selected.clear();
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            self.selected.push_back((event.token(), Ready::from_event(event)));
        }
        trace!(
            "selector {} woken with {} selected",
            self.selector.inner.id,
            self.selected.len()
        );
        true
    }

    fn fail_select(&mut self, cause: io::Error) {
        // Dropping the handle closes it; the loop exits after this.
        self.poll = None;
        if self.selector.inner.is_running() {
            warn!(
                "fatal select failure on selector {}: {cause}",
                self.selector.inner.id
            );
            self.selector.manager().on_select_failed(&cause);
        } else {
            debug!("select failed while stopping: {cause}");
        }
    }
}

fn connection_identity(connection: &Arc<dyn crate::endpoint::Connection>) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}
