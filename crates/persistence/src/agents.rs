//! Agent store
//!
//! Agents belong to exactly one organization; creation enforces the plan's
//! `max_agents` limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use callweave_core::{AgentId, OrgId};

use crate::{Keyspace, PersistenceError};

/// Agent runtime status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Active,
    Busy,
    Offline,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Active => "active",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
            AgentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(AgentStatus::Idle),
            "active" => Some(AgentStatus::Active),
            "busy" => Some(AgentStatus::Busy),
            "offline" => Some(AgentStatus::Offline),
            "error" => Some(AgentStatus::Error),
            _ => None,
        }
    }
}

/// Agent record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: AgentId,
    pub org_id: OrgId,
    pub status: AgentStatus,
    pub voice_profile: Option<String>,
    pub context_profile: Option<String>,
    pub config: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Agent store
#[derive(Clone)]
pub struct AgentStore {
    ks: Keyspace,
}

impl AgentStore {
    pub fn new(ks: Keyspace) -> Self {
        Self { ks }
    }

    /// Create an agent, enforcing the org's `max_agents` plan limit
    pub async fn create(
        &self,
        org_id: OrgId,
        max_agents: i32,
        voice_profile: Option<String>,
        context_profile: Option<String>,
    ) -> Result<AgentRecord, PersistenceError> {
        let current = self.list(org_id).await?.len() as i32;
        if current >= max_agents {
            return Err(PersistenceError::QuotaExceeded(format!(
                "agent limit {} reached",
                max_agents
            )));
        }

        let record = AgentRecord {
            agent_id: AgentId::new(),
            org_id,
            status: AgentStatus::Idle,
            voice_profile,
            context_profile,
            config: HashMap::new(),
            created_at: Utc::now(),
        };

        let query = self.ks.stmt("INSERT INTO {ks}.agents (
                org_id, agent_id, status, voice_profile, context_profile,
                config, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)");

        self.ks.session()
            .query_unpaged(
                query,
                (
                    record.org_id.0,
                    record.agent_id.0,
                    record.status.as_str(),
                    record.voice_profile.as_deref(),
                    record.context_profile.as_deref(),
                    &record.config,
                    record.created_at.timestamp_millis(),
                ),
            )
            .await?;

        Ok(record)
    }

    pub async fn get(&self, org_id: OrgId, agent_id: AgentId) -> Result<AgentRecord, PersistenceError> {
        let query = self.ks.stmt("SELECT org_id, agent_id, status, voice_profile, context_profile,
                    config, created_at
             FROM {ks}.agents WHERE org_id = ? AND agent_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0, agent_id.0))
            .await?;

        let Some(rows) = result.rows else {
            return Err(PersistenceError::NotFound);
        };
        let Some(row) = rows.into_iter().next() else {
            return Err(PersistenceError::NotFound);
        };
        Self::decode(row)
    }

    pub async fn list(&self, org_id: OrgId) -> Result<Vec<AgentRecord>, PersistenceError> {
        let query = self.ks.stmt("SELECT org_id, agent_id, status, voice_profile, context_profile,
                    config, created_at
             FROM {ks}.agents WHERE org_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0,))
            .await?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                out.push(Self::decode(row)?);
            }
        }
        Ok(out)
    }

    /// Set an agent's status (session registry transitions)
    pub async fn set_status(
        &self,
        org_id: OrgId,
        agent_id: AgentId,
        status: AgentStatus,
    ) -> Result<(), PersistenceError> {
        self.get(org_id, agent_id).await?;

        let query = self.ks.stmt("UPDATE {ks}.agents SET status = ? WHERE org_id = ? AND agent_id = ?");
        self.ks.session()
            .query_unpaged(query, (status.as_str(), org_id.0, agent_id.0))
            .await?;
        Ok(())
    }

    /// Update profile/config fields
    pub async fn update(
        &self,
        org_id: OrgId,
        agent_id: AgentId,
        voice_profile: Option<String>,
        context_profile: Option<String>,
        config: HashMap<String, String>,
    ) -> Result<(), PersistenceError> {
        self.get(org_id, agent_id).await?;

        let query = self.ks.stmt("UPDATE {ks}.agents
             SET voice_profile = ?, context_profile = ?, config = ?
             WHERE org_id = ? AND agent_id = ?");
        self.ks.session()
            .query_unpaged(
                query,
                (
                    voice_profile.as_deref(),
                    context_profile.as_deref(),
                    &config,
                    org_id.0,
                    agent_id.0,
                ),
            )
            .await?;
        Ok(())
    }

    fn decode(row: scylla::frame::response::result::Row) -> Result<AgentRecord, PersistenceError> {
        let (org_id, agent_id, status, voice_profile, context_profile, config, created_at): (
            uuid::Uuid,
            uuid::Uuid,
            String,
            Option<String>,
            Option<String>,
            Option<HashMap<String, String>>,
            i64,
        ) = row
            .into_typed()
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;

        Ok(AgentRecord {
            agent_id: AgentId(agent_id),
            org_id: OrgId(org_id),
            status: AgentStatus::parse(&status).unwrap_or_default(),
            voice_profile,
            context_profile,
            config: config.unwrap_or_default(),
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            AgentStatus::Idle,
            AgentStatus::Active,
            AgentStatus::Busy,
            AgentStatus::Offline,
            AgentStatus::Error,
        ] {
            assert_eq!(AgentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AgentStatus::parse("sleeping"), None);
    }
}
