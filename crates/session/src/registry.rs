//! Session registry
//!
//! Maps call ids to live sessions, enforces per-org concurrency, and owns
//! the agent/call status transitions around open and close. State
//! transitions serialize per call id; reads are lock-free.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use callweave_core::{
    AgentId, CallId, CallOutcome, CallStatus, EventEnvelope, OrgId, WebhookEvent,
};
use callweave_persistence::{AgentStatus, AgentStore, CallStore, OrgRecord};
use callweave_webhooks::Dispatcher;

use crate::session::{Session, SessionError};

/// Persistence seam for the registry's agent/call transitions
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn agent_status(&self, org: OrgId, agent: AgentId) -> Result<AgentStatus, SessionError>;

    async fn set_agent_status(
        &self,
        org: OrgId,
        agent: AgentId,
        status: AgentStatus,
    ) -> Result<(), SessionError>;

    async fn create_call(
        &self,
        org: OrgId,
        call: CallId,
        agent: AgentId,
        caller: &str,
    ) -> Result<(), SessionError>;

    async fn set_call_status(
        &self,
        org: OrgId,
        call: CallId,
        status: CallStatus,
    ) -> Result<(), SessionError>;
}

/// Scylla-backed implementation over the agent and call stores
pub struct PersistenceBackend {
    pub agents: AgentStore,
    pub calls: CallStore,
}

#[async_trait]
impl RegistryBackend for PersistenceBackend {
    async fn agent_status(&self, org: OrgId, agent: AgentId) -> Result<AgentStatus, SessionError> {
        Ok(self.agents.get(org, agent).await?.status)
    }

    async fn set_agent_status(
        &self,
        org: OrgId,
        agent: AgentId,
        status: AgentStatus,
    ) -> Result<(), SessionError> {
        self.agents.set_status(org, agent, status).await?;
        Ok(())
    }

    async fn create_call(
        &self,
        org: OrgId,
        call: CallId,
        agent: AgentId,
        caller: &str,
    ) -> Result<(), SessionError> {
        self.calls.create(org, call, agent, caller).await?;
        Ok(())
    }

    async fn set_call_status(
        &self,
        org: OrgId,
        call: CallId,
        status: CallStatus,
    ) -> Result<(), SessionError> {
        let ended = status != CallStatus::Active;
        self.calls.set_status(org, call, status, ended).await?;
        Ok(())
    }
}

/// Audit hook for cross-tenant lookups
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn cross_tenant_attempt(&self, org: OrgId, call: CallId);
}

/// The registry
pub struct SessionRegistry {
    sessions: DashMap<CallId, Arc<Session>>,
    /// Per-call transition locks (open/close serialization)
    transitions: DashMap<CallId, Arc<tokio::sync::Mutex<()>>>,
    backend: Arc<dyn RegistryBackend>,
    dispatcher: Arc<Dispatcher>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl SessionRegistry {
    pub fn new(
        backend: Arc<dyn RegistryBackend>,
        dispatcher: Arc<Dispatcher>,
        audit: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            transitions: DashMap::new(),
            backend,
            dispatcher,
            audit,
        }
    }

    fn active_count(&self, org: OrgId) -> i32 {
        self.sessions
            .iter()
            .filter(|entry| entry.value().org_id == org)
            .count() as i32
    }

    /// Open a session for an inbound call.
    ///
    /// Fails QuotaExceeded at the org's `max_concurrent_calls` and
    /// AgentUnavailable when the agent is not idle. On success the agent is
    /// `active` and `call_started` has fired.
    pub async fn open(
        &self,
        org: &OrgRecord,
        agent_id: AgentId,
        caller: &str,
        call_id: CallId,
    ) -> Result<Arc<Session>, SessionError> {
        let lock = self
            .transitions
            .entry(call_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.active_count(org.org_id) >= org.max_concurrent_calls {
            metrics::counter!("sessions_rejected_total", "reason" => "quota").increment(1);
            return Err(SessionError::QuotaExceeded(org.max_concurrent_calls));
        }

        let status = self.backend.agent_status(org.org_id, agent_id).await?;
        if status != AgentStatus::Idle {
            metrics::counter!("sessions_rejected_total", "reason" => "agent").increment(1);
            return Err(SessionError::AgentUnavailable);
        }

        self.backend
            .set_agent_status(org.org_id, agent_id, AgentStatus::Active)
            .await?;
        self.backend
            .create_call(org.org_id, call_id, agent_id, caller)
            .await?;

        let session = Arc::new(Session::new(call_id, org.org_id, agent_id, caller.to_string()));
        self.sessions.insert(call_id, session.clone());
        metrics::gauge!("sessions_active").increment(1.0);

        self.dispatcher.enqueue(&EventEnvelope::new(
            WebhookEvent::CallStarted,
            call_id,
            org.org_id,
            serde_json::json!({ "agent_id": agent_id, "caller": caller }),
        ));

        tracing::info!(call_id = %call_id, org_id = %org.org_id, agent_id = %agent_id, "Session opened");
        Ok(session)
    }

    /// Tenant-scoped lookup. Cross-tenant ids return NotFound, never
    /// Forbidden, and leave an audit row.
    pub async fn get(&self, org: OrgId, call_id: CallId) -> Result<Arc<Session>, SessionError> {
        match self.sessions.get(&call_id) {
            Some(entry) if entry.value().org_id == org => Ok(entry.value().clone()),
            Some(_) => {
                if let Some(audit) = &self.audit {
                    audit.cross_tenant_attempt(org, call_id).await;
                }
                Err(SessionError::NotFound)
            }
            None => Err(SessionError::NotFound),
        }
    }

    /// Close a session. Idempotent: the second close returns Ok without a
    /// second `call_ended`. Releases the session's resources on all paths.
    pub async fn close(&self, call_id: CallId, outcome: CallOutcome) -> Result<(), SessionError> {
        let lock = self
            .transitions
            .entry(call_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let Some(session) = self.sessions.get(&call_id).map(|e| e.value().clone()) else {
            // Already fully closed
            return Ok(());
        };

        if !session.mark_closed() {
            return Ok(());
        }

        // Cancellation first: in-flight HTTP, synthesis and buffers go away
        session.cancel.cancel();

        self.backend
            .set_agent_status(session.org_id, session.agent_id, AgentStatus::Idle)
            .await?;
        self.backend
            .set_call_status(session.org_id, call_id, outcome.final_status())
            .await?;

        self.dispatcher.enqueue(&EventEnvelope::new(
            WebhookEvent::CallEnded,
            call_id,
            session.org_id,
            serde_json::json!({
                "outcome": outcome,
                "duration_secs": session.duration().num_seconds(),
                "interruptions": session.interruptions(),
            }),
        ));

        self.sessions.remove(&call_id);
        self.transitions.remove(&call_id);
        metrics::gauge!("sessions_active").decrement(1.0);

        tracing::info!(call_id = %call_id, ?outcome, "Session closed");
        Ok(())
    }

    /// Ids of every live session (shutdown drain)
    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callweave_webhooks::{DispatcherConfig, WebhookTransport};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemoryBackend {
        agents: Mutex<HashMap<AgentId, AgentStatus>>,
        calls: Mutex<HashMap<CallId, CallStatus>>,
    }

    impl MemoryBackend {
        fn with_agent(agent: AgentId) -> Arc<Self> {
            let mut agents = HashMap::new();
            agents.insert(agent, AgentStatus::Idle);
            Arc::new(Self {
                agents: Mutex::new(agents),
                calls: Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl RegistryBackend for MemoryBackend {
        async fn agent_status(
            &self,
            _org: OrgId,
            agent: AgentId,
        ) -> Result<AgentStatus, SessionError> {
            self.agents
                .lock()
                .get(&agent)
                .copied()
                .ok_or(SessionError::NotFound)
        }

        async fn set_agent_status(
            &self,
            _org: OrgId,
            agent: AgentId,
            status: AgentStatus,
        ) -> Result<(), SessionError> {
            self.agents.lock().insert(agent, status);
            Ok(())
        }

        async fn create_call(
            &self,
            _org: OrgId,
            call: CallId,
            _agent: AgentId,
            _caller: &str,
        ) -> Result<(), SessionError> {
            self.calls.lock().insert(call, CallStatus::Active);
            Ok(())
        }

        async fn set_call_status(
            &self,
            _org: OrgId,
            call: CallId,
            status: CallStatus,
        ) -> Result<(), SessionError> {
            self.calls.lock().insert(call, status);
            Ok(())
        }
    }

    struct NullTransport;

    #[async_trait]
    impl WebhookTransport for NullTransport {
        async fn deliver(&self, _url: &str, _body: &[u8], _sig: &str) -> Result<u16, String> {
            Ok(200)
        }
    }

    fn org(limit: i32) -> OrgRecord {
        OrgRecord {
            org_id: OrgId::new(),
            name: "acme".into(),
            plan: callweave_persistence::OrgPlan::Professional,
            max_agents: 10,
            max_concurrent_calls: limit,
            active: true,
            settings: Default::default(),
            created_at: chrono::Utc::now(),
        }
    }

    fn registry(backend: Arc<dyn RegistryBackend>) -> SessionRegistry {
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig::default(),
            Arc::new(NullTransport),
            None,
        ));
        SessionRegistry::new(backend, dispatcher, None)
    }

    #[tokio::test]
    async fn test_open_get_close() {
        let agent = AgentId::new();
        let backend = MemoryBackend::with_agent(agent);
        let registry = registry(backend.clone());
        let org = org(5);
        let call = CallId::new();

        let session = registry.open(&org, agent, "+34600", call).await.unwrap();
        assert_eq!(
            *backend.agents.lock().get(&agent).unwrap(),
            AgentStatus::Active
        );

        let fetched = registry.get(org.org_id, call).await.unwrap();
        assert_eq!(fetched.call_id, session.call_id);

        registry.close(call, CallOutcome::Completed).await.unwrap();
        assert_eq!(
            *backend.agents.lock().get(&agent).unwrap(),
            AgentStatus::Idle
        );
        assert_eq!(
            *backend.calls.lock().get(&call).unwrap(),
            CallStatus::Ended
        );
        assert!(registry.is_empty());
        assert!(session.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_quota_enforced_at_open() {
        let agent_a = AgentId::new();
        let agent_b = AgentId::new();
        let backend = MemoryBackend::with_agent(agent_a);
        backend.agents.lock().insert(agent_b, AgentStatus::Idle);
        let registry = registry(backend);
        let org = org(1);

        registry
            .open(&org, agent_a, "+34600", CallId::new())
            .await
            .unwrap();
        let err = registry
            .open(&org, agent_b, "+34601", CallId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::QuotaExceeded(1)));
    }

    #[tokio::test]
    async fn test_busy_agent_unavailable() {
        let agent = AgentId::new();
        let backend = MemoryBackend::with_agent(agent);
        backend.agents.lock().insert(agent, AgentStatus::Busy);
        let registry = registry(backend);

        let err = registry
            .open(&org(5), agent, "+34600", CallId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AgentUnavailable));
    }

    #[tokio::test]
    async fn test_cross_tenant_get_is_not_found_and_audited() {
        struct CountingAudit(Mutex<u32>);

        #[async_trait]
        impl AuditSink for CountingAudit {
            async fn cross_tenant_attempt(&self, _org: OrgId, _call: CallId) {
                *self.0.lock() += 1;
            }
        }

        let agent = AgentId::new();
        let backend = MemoryBackend::with_agent(agent);
        let audit = Arc::new(CountingAudit(Mutex::new(0)));
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig::default(),
            Arc::new(NullTransport),
            None,
        ));
        let registry = SessionRegistry::new(backend, dispatcher, Some(audit.clone()));
        let org = org(5);
        let call = CallId::new();

        registry.open(&org, agent, "+34600", call).await.unwrap();

        let err = registry.get(OrgId::new(), call).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound));
        assert_eq!(*audit.0.lock(), 1);
    }

    #[tokio::test]
    async fn test_double_close_is_noop() {
        let agent = AgentId::new();
        let backend = MemoryBackend::with_agent(agent);
        let registry = registry(backend);
        let org = org(5);
        let call = CallId::new();

        registry.open(&org, agent, "+34600", call).await.unwrap();
        registry.close(call, CallOutcome::Completed).await.unwrap();
        // Second close succeeds without effect
        registry.close(call, CallOutcome::Completed).await.unwrap();
    }
}
