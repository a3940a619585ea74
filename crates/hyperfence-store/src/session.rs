//! Session identity (spec §4.1: "ephemeral_put ties the key's lifetime
//! to this client's session").

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub(crate) struct SessionIdAllocator(AtomicU64);

impl SessionIdAllocator {
    pub fn next(&self) -> SessionId {
        SessionId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// A live session handle. Dropping this without calling
/// [`crate::StoreClient::end_session`] leaves the session's ephemeral
/// keys and locks in place until the caller notices and tears it down
/// explicitly — this in-process store has no network-level liveness
/// probe to detect an abandoned handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub(crate) id: SessionId,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }
}
