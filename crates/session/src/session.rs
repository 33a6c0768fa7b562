//! Session handle
//!
//! The registry-visible identity of a live call. The runner owns the
//! mutable pipeline state; this handle carries what other components need:
//! tenant context, the cancellation handle, and close bookkeeping.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;

use callweave_core::{AgentId, CallId, OrgId};

use crate::cancel::CancellationHandle;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("quota exceeded: org at {0} concurrent calls")]
    QuotaExceeded(i32),

    #[error("agent unavailable")]
    AgentUnavailable,

    #[error("not found")]
    NotFound,

    #[error("persistence: {0}")]
    Persistence(#[from] callweave_persistence::PersistenceError),
}

impl From<SessionError> for callweave_core::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::QuotaExceeded(limit) => callweave_core::Error::QuotaExceeded(format!(
                "max_concurrent_calls {} reached",
                limit
            )),
            SessionError::AgentUnavailable => {
                callweave_core::Error::validation("agent unavailable")
            }
            SessionError::NotFound => callweave_core::Error::NotFound,
            SessionError::Persistence(e) => e.into(),
        }
    }
}

/// Registry-visible handle for one live call
#[derive(Debug)]
pub struct Session {
    pub call_id: CallId,
    pub org_id: OrgId,
    pub agent_id: AgentId,
    pub caller: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationHandle,
    /// Set once by the first close(); later closes are no-ops
    closed: AtomicBool,
    /// Barge-ins observed this call
    interruptions: AtomicU32,
    /// Clarification prompts spoken this call
    clarifications: AtomicU32,
}

impl Session {
    pub fn new(call_id: CallId, org_id: OrgId, agent_id: AgentId, caller: String) -> Self {
        Self {
            call_id,
            org_id,
            agent_id,
            caller,
            started_at: Utc::now(),
            cancel: CancellationHandle::new(),
            closed: AtomicBool::new(false),
            interruptions: AtomicU32::new(0),
            clarifications: AtomicU32::new(0),
        }
    }

    /// First close wins; returns whether this call performed the close
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn record_interruption(&self) -> u32 {
        self.interruptions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn interruptions(&self) -> u32 {
        self.interruptions.load(Ordering::Acquire)
    }

    /// Increment and return the clarification count
    pub fn record_clarification(&self) -> u32 {
        self.clarifications.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn clarifications(&self) -> u32 {
        self.clarifications.load(Ordering::Acquire)
    }

    pub fn duration(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(CallId::new(), OrgId::new(), AgentId::new(), "+34600".into())
    }

    #[test]
    fn test_close_once() {
        let s = session();
        assert!(s.mark_closed());
        assert!(!s.mark_closed());
        assert!(s.is_closed());
    }

    #[test]
    fn test_counters() {
        let s = session();
        assert_eq!(s.record_interruption(), 1);
        assert_eq!(s.record_interruption(), 2);
        assert_eq!(s.interruptions(), 2);

        assert_eq!(s.record_clarification(), 1);
        assert_eq!(s.clarifications(), 1);
    }
}
