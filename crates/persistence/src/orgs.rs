//! Organization store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use callweave_core::OrgId;

use crate::{Keyspace, PersistenceError};

/// Subscription plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrgPlan {
    #[default]
    Basic,
    Professional,
    Enterprise,
}

impl OrgPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgPlan::Basic => "basic",
            OrgPlan::Professional => "professional",
            OrgPlan::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "basic" => Some(OrgPlan::Basic),
            "professional" => Some(OrgPlan::Professional),
            "enterprise" => Some(OrgPlan::Enterprise),
            _ => None,
        }
    }
}

/// Organization record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgRecord {
    pub org_id: OrgId,
    pub name: String,
    pub plan: OrgPlan,
    pub max_agents: i32,
    pub max_concurrent_calls: i32,
    pub active: bool,
    pub settings: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Organization store
#[derive(Clone)]
pub struct OrgStore {
    ks: Keyspace,
}

impl OrgStore {
    pub fn new(ks: Keyspace) -> Self {
        Self { ks }
    }

    /// Create an organization (admin surface)
    pub async fn create(
        &self,
        name: &str,
        plan: OrgPlan,
        max_agents: i32,
        max_concurrent_calls: i32,
    ) -> Result<OrgRecord, PersistenceError> {
        let record = OrgRecord {
            org_id: OrgId::new(),
            name: name.to_string(),
            plan,
            max_agents,
            max_concurrent_calls,
            active: true,
            settings: HashMap::new(),
            created_at: Utc::now(),
        };

        let query = self.ks.stmt("INSERT INTO {ks}.organizations (
                org_id, name, plan, max_agents, max_concurrent_calls,
                active, settings, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");

        self.ks.session()
            .query_unpaged(
                query,
                (
                    record.org_id.0,
                    record.name.as_str(),
                    record.plan.as_str(),
                    record.max_agents,
                    record.max_concurrent_calls,
                    record.active,
                    &record.settings,
                    record.created_at.timestamp_millis(),
                ),
            )
            .await?;

        tracing::info!(org_id = %record.org_id, name = %record.name, "Organization created");
        Ok(record)
    }

    pub async fn get(&self, org_id: OrgId) -> Result<OrgRecord, PersistenceError> {
        let query = self.ks.stmt("SELECT org_id, name, plan, max_agents, max_concurrent_calls,
                    active, settings, created_at
             FROM {ks}.organizations WHERE org_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0,))
            .await?;

        let Some(rows) = result.rows else {
            return Err(PersistenceError::NotFound);
        };
        let Some(row) = rows.into_iter().next() else {
            return Err(PersistenceError::NotFound);
        };

        let (org_id, name, plan, max_agents, max_concurrent_calls, active, settings, created_at): (
            uuid::Uuid,
            String,
            String,
            i32,
            i32,
            bool,
            Option<HashMap<String, String>>,
            i64,
        ) = row
            .into_typed()
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;

        Ok(OrgRecord {
            org_id: OrgId(org_id),
            name,
            plan: OrgPlan::parse(&plan).unwrap_or_default(),
            max_agents,
            max_concurrent_calls,
            active,
            settings: settings.unwrap_or_default(),
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
        })
    }

    /// Update plan and limits; other attributes are immutable
    pub async fn update_limits(
        &self,
        org_id: OrgId,
        plan: OrgPlan,
        max_agents: i32,
        max_concurrent_calls: i32,
        active: bool,
    ) -> Result<(), PersistenceError> {
        // Confirm existence first so an update cannot create a phantom org
        self.get(org_id).await?;

        let query = self.ks.stmt("UPDATE {ks}.organizations
             SET plan = ?, max_agents = ?, max_concurrent_calls = ?, active = ?
             WHERE org_id = ?");

        self.ks.session()
            .query_unpaged(
                query,
                (plan.as_str(), max_agents, max_concurrent_calls, active, org_id.0),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_round_trip() {
        for plan in [OrgPlan::Basic, OrgPlan::Professional, OrgPlan::Enterprise] {
            assert_eq!(OrgPlan::parse(plan.as_str()), Some(plan));
        }
        assert_eq!(OrgPlan::parse("platinum"), None);
    }
}
