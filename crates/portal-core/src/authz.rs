//! Per-client authorization state shared by the DNS and HTTP gateways.
//!
//! A client with no entry is implicitly [`ClientState::Blocked`]. Entries are
//! created the first time a client is seen and are never removed; the table
//! lives as long as the process.
//!
//! Every operation takes the single table-wide lock for an O(1) map access
//! and performs no I/O, so a plain `std::sync::Mutex` is enough even when
//! called from async tasks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Authorization state of a single client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// DNS queries are answered with the portal address.
    Blocked,
    /// DNS queries are relayed to the upstream resolver.
    Allowed,
}

#[derive(Debug, Clone)]
struct ClientRecord {
    state: ClientState,
    /// Wall-clock time the client was last recorded as blocked. Informational.
    blocked_at: Option<SystemTime>,
    /// When the current grant started; drives session expiry.
    allowed_at: Option<Instant>,
}

impl ClientRecord {
    fn blocked() -> Self {
        Self {
            state: ClientState::Blocked,
            blocked_at: Some(SystemTime::now()),
            allowed_at: None,
        }
    }

    fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match (ttl, self.allowed_at) {
            (Some(ttl), Some(at)) => now.duration_since(at) >= ttl,
            _ => false,
        }
    }
}

/// Shared map of client IP to authorization state.
#[derive(Debug, Default)]
pub struct AuthorizationTable {
    clients: Mutex<HashMap<IpAddr, ClientRecord>>,
    /// Lifetime of a grant. `None` keeps clients allowed until logout.
    session_ttl: Option<Duration>,
}

impl AuthorizationTable {
    /// Create an empty table whose grants never expire.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty table whose grants expire after `ttl`.
    pub fn with_session_ttl(ttl: Option<Duration>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            session_ttl: ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, ClientRecord>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` iff the client is currently allowed and its grant has
    /// not outlived the session TTL.
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        let clients = self.lock();
        match clients.get(ip) {
            Some(record) => {
                record.state == ClientState::Allowed
                    && !record.is_expired(self.session_ttl, Instant::now())
            }
            None => false,
        }
    }

    /// Mark the client allowed. Idempotent while the grant is live; a
    /// repeated call keeps the original grant time, a call after the grant
    /// expired starts a new one.
    pub fn allow(&self, ip: IpAddr) {
        let now = Instant::now();
        let mut clients = self.lock();
        let record = clients.entry(ip).or_insert_with(ClientRecord::blocked);
        if record.state != ClientState::Allowed || record.is_expired(self.session_ttl, now) {
            record.allowed_at = Some(now);
        }
        record.state = ClientState::Allowed;
        record.blocked_at = None;
    }

    /// Mark the client blocked and stamp the time.
    pub fn block(&self, ip: IpAddr) {
        let mut clients = self.lock();
        clients.insert(ip, ClientRecord::blocked());
    }

    /// Start tracking a client as blocked unless it is already known.
    ///
    /// Returns `true` if a new entry was created.
    pub fn observe(&self, ip: IpAddr) -> bool {
        let mut clients = self.lock();
        if clients.contains_key(&ip) {
            return false;
        }
        clients.insert(ip, ClientRecord::blocked());
        true
    }

    /// Current state of a tracked client, `None` if it was never seen.
    pub fn state(&self, ip: &IpAddr) -> Option<ClientState> {
        self.lock().get(ip).map(|r| r.state)
    }

    /// Time the client was last blocked, if it is blocked.
    pub fn blocked_at(&self, ip: &IpAddr) -> Option<SystemTime> {
        self.lock().get(ip).and_then(|r| r.blocked_at)
    }

    /// Copy of every tracked client and its state.
    pub fn snapshot(&self) -> Vec<(IpAddr, ClientState)> {
        self.lock().iter().map(|(ip, r)| (*ip, r.state)).collect()
    }

    /// Move every grant older than the session TTL back to blocked.
    ///
    /// Returns the affected clients so the caller can re-apply firewall rules.
    /// Does nothing when no TTL is configured.
    pub fn expire_allowed(&self) -> Vec<IpAddr> {
        if self.session_ttl.is_none() {
            return Vec::new();
        }

        let now = Instant::now();
        let mut clients = self.lock();
        let mut expired = Vec::new();
        for (ip, record) in clients.iter_mut() {
            if record.state == ClientState::Allowed && record.is_expired(self.session_ttl, now) {
                *record = ClientRecord::blocked();
                expired.push(*ip);
            }
        }
        expired
    }

    /// Number of tracked clients.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
