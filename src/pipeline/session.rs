//! # Join → DevAddr Session Tracking
//!
//! A Join Request names a DevEUI but the DevAddr it will be assigned is
//! invisible to a passive listener (the Join Accept is encrypted). This
//! tracker keeps recent joins pending and binds them to the first data
//! uplink that can be attributed unambiguously, producing an opaque session
//! id and backfilling the DevEUI onto post-join packets.
//!
//! The map is owned by the pipeline worker; no synchronization is needed.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// A join seen on the air, not yet bound to a DevAddr.
#[derive(Debug, Clone)]
struct PendingJoin {
    dev_eui: String,
    join_eui: String,
    /// Operator resolved from the JoinEUI table at join time.
    operator: String,
    session_id: String,
    created_at: DateTime<Utc>,
}

/// An established binding, keyed by DevAddr.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub dev_eui: String,
    pub join_eui: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Enrichment returned for a data uplink with a known session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStamp {
    pub session_id: String,
    pub dev_eui: String,
}

fn new_session_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// In-memory correlator between Join Requests and later data uplinks.
#[derive(Debug)]
pub struct SessionTracker {
    /// Joins waiting for their first uplink, keyed by DevEUI.
    pending: HashMap<String, PendingJoin>,
    /// Bound sessions, keyed by DevAddr.
    sessions: HashMap<String, SessionContext>,
    /// Entries idle longer than this are swept.
    inactivity_window: Duration,
}

impl SessionTracker {
    pub fn new(inactivity_window: Duration) -> Self {
        SessionTracker {
            pending: HashMap::new(),
            sessions: HashMap::new(),
            inactivity_window,
        }
    }

    /// Record a Join Request. A repeated join for the same DevEUI replaces
    /// the pending entry (the device rejoined before sending data).
    pub fn on_join_request(
        &mut self,
        dev_eui: &str,
        join_eui: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> String {
        let session_id = new_session_id();
        self.pending.insert(
            dev_eui.to_string(),
            PendingJoin {
                dev_eui: dev_eui.to_string(),
                join_eui: join_eui.to_string(),
                operator: operator.to_string(),
                session_id: session_id.clone(),
                created_at: now,
            },
        );
        session_id
    }

    /// Enrich a data uplink. An already-bound DevAddr is stamped directly;
    /// an unknown one is bound only when exactly one pending join matches
    /// the packet's operator — with several candidates the uplink stays
    /// unstamped rather than guessing.
    pub fn on_data_uplink(
        &mut self,
        dev_addr: &str,
        operator: &str,
        now: DateTime<Utc>,
    ) -> Option<SessionStamp> {
        if let Some(session) = self.sessions.get_mut(dev_addr) {
            session.last_seen = now;
            return Some(SessionStamp {
                session_id: session.session_id.clone(),
                dev_eui: session.dev_eui.clone(),
            });
        }

        let mut candidates = self
            .pending
            .values()
            .filter(|join| join.operator == operator)
            .collect::<Vec<_>>();
        if candidates.len() != 1 {
            return None;
        }
        let join = candidates.pop().expect("len checked").clone();
        self.pending.remove(&join.dev_eui);
        let stamp = SessionStamp {
            session_id: join.session_id.clone(),
            dev_eui: join.dev_eui.clone(),
        };
        self.sessions.insert(
            dev_addr.to_string(),
            SessionContext {
                dev_eui: join.dev_eui,
                join_eui: join.join_eui,
                session_id: join.session_id,
                created_at: join.created_at,
                last_seen: now,
            },
        );
        Some(stamp)
    }

    /// Evict pending joins and idle sessions older than the window.
    /// Returns the number of evicted entries.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.inactivity_window;
        let before = self.pending.len() + self.sessions.len();
        self.pending.retain(|_, join| join.created_at > cutoff);
        self.sessions.retain(|_, session| session.last_seen > cutoff);
        before - (self.pending.len() + self.sessions.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
