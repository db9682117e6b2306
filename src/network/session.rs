//! Session
//!
//! Per-connection state shared between the reactor (socket I/O) and the
//! engine (game logic). The inbound buffer and the decryptor are not in here:
//! they belong to the connection task and never leave the reactor thread.
//!
//! What is shared:
//! - the lifecycle state, which only ever moves forward
//! - the outbound buffer, filled by the encoder and drained by the reactor
//! - the encryptor, which must advance in the same order bytes are queued
//! - the key of the player bound to this connection

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::warn;

use crate::core::IsaacCipher;
use crate::game::entity::EntityKey;

/// Unique connection identifier, assigned by the reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Connection lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Accepted, nothing read yet.
    Connecting = 0,
    /// Login exchange in progress.
    Handshaking = 1,
    /// Logged in; frames flow.
    Established = 2,
    /// Flushing remaining output before the socket is released.
    Closing = 3,
    /// Socket released.
    Closed = 4,
}

impl SessionState {
    fn from_u8(raw: u8) -> SessionState {
        match raw {
            0 => SessionState::Connecting,
            1 => SessionState::Handshaking,
            2 => SessionState::Established,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Pending output grew past the limit; the session is now closing.
    #[error("outbound buffer overflow: {pending} bytes pending (limit {limit})")]
    OutboundOverflow {
        /// Bytes that would have been pending.
        pending: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Output queued on a session that is closing or closed.
    #[error("session is closed")]
    Closed,
}

/// State shared by one connection's I/O task and the engine.
pub struct Session {
    id: SessionId,
    addr: SocketAddr,
    state: AtomicU8,
    outbound: Mutex<BytesMut>,
    encryptor: Mutex<Option<IsaacCipher>>,
    player: Mutex<Option<EntityKey>>,
    notify: Notify,
    max_outbound: usize,
}

impl Session {
    /// Create a session in [`SessionState::Connecting`].
    pub fn new(id: SessionId, addr: SocketAddr, max_outbound: usize) -> Self {
        Self {
            id,
            addr,
            state: AtomicU8::new(SessionState::Connecting as u8),
            outbound: Mutex::new(BytesMut::new()),
            encryptor: Mutex::new(None),
            player: Mutex::new(None),
            notify: Notify::new(),
            max_outbound,
        }
    }

    /// Connection id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Peer address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True before closing has started.
    pub fn is_open(&self) -> bool {
        self.state() < SessionState::Closing
    }

    /// Move to `next` if that is forward of the current state.
    ///
    /// Returns false (and changes nothing) for backward or repeated moves.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if next as u8 <= current {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Start closing and wake the connection task so it flushes and exits.
    pub fn close(&self) {
        if self.advance(SessionState::Closing) {
            self.notify.notify_one();
        }
    }

    /// Install the outbound cipher.
    pub fn set_encryptor(&self, cipher: IsaacCipher) {
        *self.encryptor.lock() = Some(cipher);
    }

    /// Run `f` with the encryptor locked. `None` before login.
    pub fn with_encryptor<R>(&self, f: impl FnOnce(&mut IsaacCipher) -> R) -> Option<R> {
        self.encryptor.lock().as_mut().map(f)
    }

    /// Append raw bytes to the outbound buffer and wake the connection task.
    ///
    /// Exceeding the outbound limit closes the session.
    pub fn queue_raw(&self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.state() >= SessionState::Closing {
            return Err(SessionError::Closed);
        }
        {
            let mut outbound = self.outbound.lock();
            let pending = outbound.len() + bytes.len();
            if pending > self.max_outbound {
                drop(outbound);
                warn!(session = %self.id, pending, limit = self.max_outbound, "Outbound overflow, closing");
                self.close();
                return Err(SessionError::OutboundOverflow {
                    pending,
                    limit: self.max_outbound,
                });
            }
            outbound.extend_from_slice(bytes);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take everything queued for writing.
    pub fn take_outbound(&self) -> Option<BytesMut> {
        let mut outbound = self.outbound.lock();
        if outbound.is_empty() {
            None
        } else {
            Some(outbound.split())
        }
    }

    /// Bytes waiting to be written.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Bind the player that logged in on this connection.
    pub fn bind_player(&self, key: EntityKey) {
        *self.player.lock() = Some(key);
    }

    /// Player bound to this connection.
    pub fn player(&self) -> Option<EntityKey> {
        *self.player.lock()
    }

    /// Wait for output or a close request.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake the connection task.
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("player", &self.player())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::EntityKind;

    fn session(limit: usize) -> Session {
        Session::new(SessionId(1), "127.0.0.1:43594".parse().unwrap(), limit)
    }

    #[test]
    fn test_state_only_moves_forward() {
        let session = session(64);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.advance(SessionState::Handshaking));
        assert!(session.advance(SessionState::Established));
        assert!(!session.advance(SessionState::Handshaking));
        assert!(!session.advance(SessionState::Established));
        assert_eq!(session.state(), SessionState::Established);
        assert!(session.is_open());

        session.close();
        assert_eq!(session.state(), SessionState::Closing);
        assert!(!session.is_open());
        assert!(session.advance(SessionState::Closed));
        assert!(!session.advance(SessionState::Closing));
    }

    #[test]
    fn test_outbound_queue_and_take() {
        let session = session(64);
        session.queue_raw(&[1, 2]).unwrap();
        session.queue_raw(&[3]).unwrap();
        assert_eq!(session.pending_outbound(), 3);
        assert_eq!(session.take_outbound().unwrap().as_ref(), &[1, 2, 3]);
        assert!(session.take_outbound().is_none());
    }

    #[test]
    fn test_outbound_overflow_closes() {
        let session = session(4);
        session.queue_raw(&[0; 3]).unwrap();
        assert_eq!(
            session.queue_raw(&[0; 2]),
            Err(SessionError::OutboundOverflow { pending: 5, limit: 4 })
        );
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.queue_raw(&[0]), Err(SessionError::Closed));
    }

    #[test]
    fn test_player_binding() {
        let session = session(4);
        assert_eq!(session.player(), None);
        let key = EntityKey { kind: EntityKind::Player, index: 3, generation: 1 };
        session.bind_player(key);
        assert_eq!(session.player(), Some(key));
    }

    #[tokio::test]
    async fn test_queue_wakes_waiter() {
        let session = session(64);
        // The permit is stored even though nobody is waiting yet.
        session.queue_raw(&[9]).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), session.notified())
            .await
            .expect("notification should be pending");
    }
}
