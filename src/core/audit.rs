//! Lease audit trail.
//!
//! Provides the audit sink abstraction used by capacity managers and a bounded
//! in-memory implementation.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::capacity::{LeaseId, ResourceKey};

/// What happened to a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseAction {
    /// A lease was issued.
    Granted,
    /// A request was refused for lack of capacity.
    Denied,
    /// A lease was renewed under a new identifier.
    Extended,
    /// A lease was released by its holder.
    Released,
    /// A lease reached its expiry and was reclaimed.
    Expired,
}

impl fmt::Display for LeaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Extended => "extended",
            Self::Released => "released",
            Self::Expired => "expired",
        })
    }
}

/// Audit record for one lease transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAuditEvent {
    /// Lease concerned; `None` for denials.
    pub lease_id: Option<LeaseId>,
    /// Identifier that replaced `lease_id` on extension.
    pub replaced_by: Option<LeaseId>,
    /// Action taken.
    pub action: LeaseAction,
    /// Resources involved.
    pub resources: Vec<ResourceKey>,
    /// Timestamp milliseconds.
    pub created_at_ms: u64,
}

/// Audit sink abstraction.
pub trait LeaseAuditSink: Send + Sync {
    /// Record an audit event.
    fn record(&self, event: LeaseAuditEvent);
}

/// In-memory audit sink for testing and dev.
///
/// Keeps the most recent `max_events` records.
pub struct InMemoryLeaseAuditSink {
    events: Mutex<VecDeque<LeaseAuditEvent>>,
    max_events: usize,
}

impl InMemoryLeaseAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<LeaseAuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Actions of the stored events, oldest first.
    pub fn actions(&self) -> Vec<LeaseAction> {
        self.events.lock().iter().map(|e| e.action).collect()
    }
}

impl LeaseAuditSink for InMemoryLeaseAuditSink {
    fn record(&self, event: LeaseAuditEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}
