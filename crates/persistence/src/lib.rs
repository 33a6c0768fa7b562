//! ScyllaDB persistence layer
//!
//! Tenant-scoped storage for organizations, API tokens, agents, calls and
//! turns, per-turn metrics and call events, QA evaluations, webhook
//! subscriptions/deliveries, and the audit log. Every store API takes an
//! `OrgId`; a row belonging to another tenant is indistinguishable from a
//! missing one.

pub mod agents;
pub mod audit;
pub mod calls;
pub mod client;
pub mod error;
pub mod orgs;
pub mod qa;
pub mod schema;
pub mod tokens;
pub mod webhooks;

pub use agents::{AgentRecord, AgentStatus, AgentStore};
pub use audit::{AuditKind, AuditStore};
pub use calls::{CallStore, MetricsSummary, TurnMetricsRow};
pub use client::Keyspace;
pub use error::PersistenceError;
pub use orgs::{OrgPlan, OrgRecord, OrgStore};
pub use qa::{QaCriterion, QaEvaluation, QaStore};
pub use tokens::{validate_token_shape, ApiTokenRecord, Scope, TokenContext, TokenStore};
pub use webhooks::{WebhookDeliveryRow, WebhookRecord, WebhookStore};

use callweave_config::ScyllaSettings;

/// Combined persistence layer with all stores
pub struct PersistenceLayer {
    pub orgs: OrgStore,
    pub tokens: TokenStore,
    pub agents: AgentStore,
    pub calls: CallStore,
    pub qa: QaStore,
    pub webhooks: WebhookStore,
    pub audit: AuditStore,
}

/// Connect with the configured settings, ensure the schema, and hand back
/// every store sharing the keyspace handle.
pub async fn init(settings: &ScyllaSettings) -> Result<PersistenceLayer, PersistenceError> {
    let ks = Keyspace::connect(settings).await?;

    Ok(PersistenceLayer {
        orgs: OrgStore::new(ks.clone()),
        tokens: TokenStore::new(ks.clone()),
        agents: AgentStore::new(ks.clone()),
        calls: CallStore::new(ks.clone()),
        qa: QaStore::new(ks.clone()),
        webhooks: WebhookStore::new(ks.clone()),
        audit: AuditStore::new(ks),
    })
}
