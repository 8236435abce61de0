// session.rs

use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::*;
use thiserror::Error;

/// Compile-time ceiling on tracked sessions; the runtime cap is
/// `max_connections` from the web config, clamped to this.
pub const SESSION_CEILING: usize = 8;

pub type SessionId = u32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session table is full")]
    TableFull,
    #[error("unknown or expired session")]
    UnknownSession,
}

#[derive(Clone, Copy, Debug)]
pub struct Session {
    pub id: SessionId,
    pub client: IpAddr,
    pub created_at: Instant,
    pub last_seen: Instant,
    pub expires_at: Instant,
}

impl Session {
    /// A session stays alive through `expires_at` inclusive.
    fn is_dead(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

struct TableInner {
    sessions: heapless::Vec<Session, SESSION_CEILING>,
    next_id: SessionId,
}

/// Bounded set of remote-client sessions, keyed by client address.
///
/// All mutations happen inside one short mutex-guarded critical section
/// with no suspension points, since web handlers touch the table
/// concurrently.
pub struct SessionTable {
    inner: Mutex<TableInner>,
    timeout: Duration,
    capacity: usize,
}

impl SessionTable {
    pub fn new(timeout: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                sessions: heapless::Vec::new(),
                next_id: 1,
            }),
            timeout,
            capacity: capacity.min(SESSION_CEILING),
        }
    }

    /// Create a session for `client`, or refresh the one it already has.
    /// Fails with `TableFull` when the table is at capacity and nothing is
    /// expired and evictable.
    pub fn start_session(&self, client: IpAddr, now: Instant) -> Result<SessionId, SessionError> {
        let mut inner = self.lock();

        if let Some(s) = inner.sessions.iter_mut().find(|s| s.client == client) {
            s.last_seen = now;
            s.expires_at = now + self.timeout;
            return Ok(s.id);
        }

        Self::remove_dead(&mut inner, now);
        if inner.sessions.len() >= self.capacity {
            return Err(SessionError::TableFull);
        }

        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        let session = Session {
            id,
            client,
            created_at: now,
            last_seen: now,
            expires_at: now + self.timeout,
        };
        // cannot overflow: capacity <= SESSION_CEILING checked above
        let _ = inner.sessions.push(session);
        debug!("Session {id} started for {client}");
        Ok(id)
    }

    /// Extend a session's lifetime. Fails if the handle is stale or the
    /// session already expired.
    pub fn heartbeat(&self, id: SessionId, now: Instant) -> Result<(), SessionError> {
        let mut inner = self.lock();
        Self::remove_dead(&mut inner, now);
        let s = inner
            .sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(SessionError::UnknownSession)?;
        s.last_seen = now;
        s.expires_at = now + self.timeout;
        Ok(())
    }

    /// True iff at least one session is still alive. Consulted by power
    /// management, so expired entries are swept first.
    pub fn has_active_sessions(&self, now: Instant) -> bool {
        self.active_count(now) > 0
    }

    pub fn active_count(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        Self::remove_dead(&mut inner, now);
        inner.sessions.len()
    }

    /// Drop every expired session.
    pub fn sweep(&self, now: Instant) {
        let mut inner = self.lock();
        let before = inner.sessions.len();
        Self::remove_dead(&mut inner, now);
        let removed = before - inner.sessions.len();
        if removed > 0 {
            debug!("Swept {removed} expired web sessions");
        }
    }

    fn remove_dead(inner: &mut TableInner, now: Instant) {
        while let Some(pos) = inner.sessions.iter().position(|s| s.is_dead(now)) {
            inner.sessions.swap_remove(pos);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    #[test]
    fn table_never_exceeds_capacity() {
        let t0 = Instant::now();
        let table = SessionTable::new(Duration::from_secs(300), 2);

        table.start_session(ip(1), t0).unwrap();
        table.start_session(ip(2), t0).unwrap();
        assert_eq!(table.start_session(ip(3), t0), Err(SessionError::TableFull));
        assert_eq!(table.active_count(t0), 2);
    }

    #[test]
    fn same_client_refreshes_instead_of_growing() {
        let t0 = Instant::now();
        let table = SessionTable::new(Duration::from_secs(300), 2);

        let a = table.start_session(ip(1), t0).unwrap();
        let b = table
            .start_session(ip(1), t0 + Duration::from_secs(10))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(table.active_count(t0 + Duration::from_secs(10)), 1);
    }

    #[test]
    fn expired_session_is_evicted_for_newcomer() {
        let t0 = Instant::now();
        let table = SessionTable::new(Duration::from_secs(60), 2);

        table.start_session(ip(1), t0).unwrap();
        table.start_session(ip(2), t0).unwrap();

        // after ip(1) and ip(2) expire, a third client fits
        let later = t0 + Duration::from_secs(61);
        assert!(table.start_session(ip(3), later).is_ok());
        assert_eq!(table.active_count(later), 1);
    }

    #[test]
    fn liveness_boundary_is_inclusive() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(120);
        let table = SessionTable::new(timeout, 4);
        table.start_session(ip(1), t0).unwrap();

        // alive for now <= t0 + timeout
        assert!(table.has_active_sessions(t0 + timeout));
        // dead for now > t0 + timeout
        assert!(!table.has_active_sessions(t0 + timeout + Duration::from_millis(1)));
    }

    #[test]
    fn heartbeat_extends_expiry() {
        let t0 = Instant::now();
        let table = SessionTable::new(Duration::from_secs(60), 4);
        let id = table.start_session(ip(1), t0).unwrap();

        table.heartbeat(id, t0 + Duration::from_secs(50)).unwrap();
        assert!(table.has_active_sessions(t0 + Duration::from_secs(100)));
        assert!(!table.has_active_sessions(t0 + Duration::from_secs(111)));
    }

    #[test]
    fn heartbeat_on_dead_session_is_unknown() {
        let t0 = Instant::now();
        let table = SessionTable::new(Duration::from_secs(60), 4);
        let id = table.start_session(ip(1), t0).unwrap();

        assert_eq!(
            table.heartbeat(id, t0 + Duration::from_secs(61)),
            Err(SessionError::UnknownSession)
        );
        assert_eq!(table.heartbeat(999, t0), Err(SessionError::UnknownSession));
    }

    #[test]
    fn sweep_removes_only_dead() {
        let t0 = Instant::now();
        let table = SessionTable::new(Duration::from_secs(60), 4);
        table.start_session(ip(1), t0).unwrap();
        table
            .start_session(ip(2), t0 + Duration::from_secs(30))
            .unwrap();

        table.sweep(t0 + Duration::from_secs(61));
        assert_eq!(table.active_count(t0 + Duration::from_secs(61)), 1);
    }
}

// EOF
