use mio::event::Source;
use mio::{Interest, Registry, Token};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::executor::Job;

/// Readiness snapshot captured from the OS event and handed to
/// [`Selectable::on_selected`].
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready(u8);

impl Ready {
    const READABLE: u8 = 1 << 0;
    const WRITABLE: u8 = 1 << 1;
    const READ_CLOSED: u8 = 1 << 2;
    const WRITE_CLOSED: u8 = 1 << 3;
    const ERROR: u8 = 1 << 4;

    pub(crate) fn from_event(event: &mio::event::Event) -> Self {
        let mut bits = 0;
        if event.is_readable() {
            bits |= Self::READABLE;
        }
        if event.is_writable() {
            bits |= Self::WRITABLE;
        }
        if event.is_read_closed() {
            bits |= Self::READ_CLOSED;
        }
        if event.is_write_closed() {
            bits |= Self::WRITE_CLOSED;
        }
        if event.is_error() {
            bits |= Self::ERROR;
        }
        Ready(bits)
    }

    #[cfg(test)]
    pub(crate) const fn from_bits(bits: u8) -> Self {
        Ready(bits)
    }

    // A closed read half still demands a read so the endpoint observes EOF.
    #[inline(always)]
    pub fn is_readable(&self) -> bool {
        self.0 & (Self::READABLE | Self::READ_CLOSED) != 0
    }

    #[inline(always)]
    pub fn is_writable(&self) -> bool {
        self.0 & (Self::WRITABLE | Self::WRITE_CLOSED) != 0
    }

    #[inline(always)]
    pub fn is_read_closed(&self) -> bool {
        self.0 & Self::READ_CLOSED != 0
    }

    #[inline(always)]
    pub fn is_write_closed(&self) -> bool {
        self.0 & Self::WRITE_CLOSED != 0
    }

    #[inline(always)]
    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ready({}{}{}{}{})",
            if self.0 & Self::READABLE != 0 { "r" } else { "-" },
            if self.0 & Self::WRITABLE != 0 { "w" } else { "-" },
            if self.0 & Self::READ_CLOSED != 0 { "R" } else { "-" },
            if self.0 & Self::WRITE_CLOSED != 0 { "W" } else { "-" },
            if self.0 & Self::ERROR != 0 { "e" } else { "-" },
        )
    }
}

/// Handle to a single registration on a selector.
///
/// The handle remembers whether its token has been registered with the OS,
/// so the first `set_interest` registers and later calls reregister. Clones
/// share that state.
#[derive(Clone)]
pub struct SelectorKey {
    registry: Arc<Registry>,
    token: Token,
    registered: Arc<AtomicBool>,
}

impl SelectorKey {
    pub(crate) fn new(registry: Arc<Registry>, token: Token, registered: bool) -> Self {
        Self {
            registry,
            token,
            registered: Arc::new(AtomicBool::new(registered)),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn set_interest<S: Source>(&self, source: &mut S, interest: Interest) -> io::Result<()> {
        if self.registered.load(Ordering::Acquire) {
            self.registry.reregister(source, self.token, interest)
        } else {
            self.registry.register(source, self.token, interest)?;
            self.registered.store(true, Ordering::Release);
            Ok(())
        }
    }

    /// Drops the registration. Safe to call more than once.
    pub fn clear<S: Source>(&self, source: &mut S) -> io::Result<()> {
        if self.registered.swap(false, Ordering::AcqRel) {
            self.registry.deregister(source)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for SelectorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorKey")
            .field("token", &self.token)
            .field("registered", &self.registered.load(Ordering::Relaxed))
            .finish()
    }
}

/// An endpoint that wishes to be notified of non-blocking events by a
/// selector.
pub trait Selectable: Send + Sync {
    /// Invoked on the loop thread when a readiness event has been detected
    /// for this endpoint.
    ///
    /// Returns a job that may block, or `None` when the event was handled
    /// inline. The job is run by the selector's execution strategy, never on
    /// the loop thread while it still owns production.
    fn on_selected(&self, ready: Ready) -> Option<Box<dyn Job>>;

    /// Invoked once per select cycle, after every selected key has been
    /// processed, so the endpoint can recompute its interest set.
    fn update_key(&self);
}

pub trait Connection: Send + Sync {
    fn close(&self);
}

pub trait Endpoint: Selectable {
    fn connection(&self) -> Option<Arc<dyn Connection>>;

    fn set_connection(&self, connection: Arc<dyn Connection>);

    fn on_open(&self) {}

    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;
    use mio::Poll;

    #[test]
    fn ready_flags() {
        let ready = Ready::from_bits(0b00001);
        assert!(ready.is_readable());
        assert!(!ready.is_writable());
        assert!(!ready.is_empty());
    }

    #[test]
    fn read_closed_counts_as_readable() {
        let ready = Ready::from_bits(0b00100);
        assert!(ready.is_readable());
        assert!(ready.is_read_closed());
        assert!(!ready.is_writable());
    }

    #[test]
    fn empty_ready() {
        let ready = Ready::default();
        assert!(ready.is_empty());
        assert!(!ready.is_readable());
        assert!(!ready.is_writable());
        assert_eq!(format!("{ready:?}"), "Ready(-----)");
    }

    #[test]
    fn key_registers_then_reregisters() -> io::Result<()> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap())?;

        let key = SelectorKey::new(registry, Token(7), false);
        assert_eq!(key.token(), Token(7));

        key.set_interest(&mut listener, Interest::READABLE)?;
        // Second call must take the reregister path on the live token.
        key.set_interest(&mut listener, Interest::READABLE | Interest::WRITABLE)?;

        key.clear(&mut listener)?;
        // Clearing twice is a no-op.
        key.clear(&mut listener)?;
        Ok(())
    }

    #[test]
    fn key_clones_share_registration_state() -> io::Result<()> {
        let poll = Poll::new()?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap())?;

        let key = SelectorKey::new(registry, Token(3), false);
        let clone = key.clone();
        key.set_interest(&mut listener, Interest::READABLE)?;
        // The clone sees the registration and must reregister, not register.
        clone.set_interest(&mut listener, Interest::WRITABLE)?;
        clone.clear(&mut listener)?;
        Ok(())
    }
}
