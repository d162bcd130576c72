//! Transaction session contract.
//!
//! The real transaction manager lives outside this crate; the allocation
//! core only needs to know whether a session that wrote into a segment is
//! still open. A segment referenced by an open session cannot be flushed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub type TxnId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    InFlight,
    Committed,
    RolledBack,
}

/// One open transaction on a pchannel.
pub struct TxnSession {
    id: TxnId,
    state: Mutex<TxnState>,
    /// The session is abandoned once its keepalive lapses.
    expires_at: Instant,
}

impl TxnSession {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn commit(&self) {
        let mut state = self.state.lock();
        if *state == TxnState::InFlight {
            *state = TxnState::Committed;
        }
    }

    pub fn rollback(&self) {
        let mut state = self.state.lock();
        if *state == TxnState::InFlight {
            *state = TxnState::RolledBack;
        }
    }

    /// Committed, rolled back, or expired: the session no longer pins any
    /// segment.
    pub fn is_done(&self) -> bool {
        *self.state.lock() != TxnState::InFlight || Instant::now() >= self.expires_at
    }
}

/// Hands out transaction sessions for one pchannel.
pub struct TxnManager {
    next_id: AtomicI64,
}

impl TxnManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }

    pub fn begin(&self, keepalive: Duration) -> Arc<TxnSession> {
        Arc::new(TxnSession {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TxnState::InFlight),
            expires_at: Instant::now() + keepalive,
        })
    }
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}
