//! Audit log
//!
//! Operator-visible trail of security-relevant actions: cross-tenant
//! attempts, token rotations, admin changes. Append-only, newest first.

use chrono::Utc;
use uuid::Uuid;

use callweave_core::OrgId;

use crate::{Keyspace, PersistenceError};

/// Kinds of audited actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    CrossTenantAttempt,
    TokenCreated,
    TokenRotated,
    OrgUpdated,
    ConfigReloaded,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::CrossTenantAttempt => "cross_tenant_attempt",
            AuditKind::TokenCreated => "token_created",
            AuditKind::TokenRotated => "token_rotated",
            AuditKind::OrgUpdated => "org_updated",
            AuditKind::ConfigReloaded => "config_reloaded",
        }
    }
}

/// Audit store
#[derive(Clone)]
pub struct AuditStore {
    ks: Keyspace,
}

impl AuditStore {
    pub fn new(ks: Keyspace) -> Self {
        Self { ks }
    }

    /// Append one audit row; failures are logged, never propagated, so an
    /// unavailable audit table cannot take down the request path.
    pub async fn record(&self, org_id: OrgId, kind: AuditKind, detail: &str) {
        let query = self.ks.stmt("INSERT INTO {ks}.audit_log (org_id, created_at, audit_id, kind, detail)
             VALUES (?, ?, ?, ?, ?)");

        let result = self.ks.session()
            .query_unpaged(
                query,
                (
                    org_id.0,
                    Utc::now().timestamp_millis(),
                    Uuid::new_v4(),
                    kind.as_str(),
                    detail,
                ),
            )
            .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, kind = kind.as_str(), "Audit write failed");
        }
    }

    /// Recent audit rows for one org
    pub async fn recent(
        &self,
        org_id: OrgId,
        limit: i32,
    ) -> Result<Vec<(String, String)>, PersistenceError> {
        let query = self.ks.stmt("SELECT kind, detail FROM {ks}.audit_log WHERE org_id = ? LIMIT ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0, limit))
            .await?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (kind, detail): (String, String) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                out.push((kind, detail));
            }
        }
        Ok(out)
    }
}
