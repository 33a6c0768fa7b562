//! Webhook subscription and delivery store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use callweave_core::{OrgId, WebhookEvent, WebhookId};

use crate::{Keyspace, PersistenceError};

/// A persisted subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRecord {
    pub webhook_id: WebhookId,
    pub org_id: OrgId,
    pub url: String,
    pub events: Vec<WebhookEvent>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// A persisted delivery attempt trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDeliveryRow {
    pub delivery_id: Uuid,
    pub webhook_id: WebhookId,
    pub org_id: OrgId,
    pub event_type: String,
    pub payload: String,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookDeliveryRow {
    /// One attempt entry; `last_status` is "delivered", "dead", or the HTTP
    /// status of a failed attempt.
    pub fn attempt(
        org_id: OrgId,
        webhook_id: WebhookId,
        event_type: &str,
        attempt_count: i32,
        last_status: Option<String>,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            webhook_id,
            org_id,
            event_type: event_type.to_string(),
            payload: String::new(),
            attempt_count,
            next_attempt_at,
            last_status,
            created_at: Utc::now(),
        }
    }
}

/// Webhook store
#[derive(Clone)]
pub struct WebhookStore {
    ks: Keyspace,
}

impl WebhookStore {
    pub fn new(ks: Keyspace) -> Self {
        Self { ks }
    }

    pub async fn create(
        &self,
        org_id: OrgId,
        url: &str,
        events: Vec<WebhookEvent>,
        secret: &str,
        description: Option<&str>,
    ) -> Result<WebhookRecord, PersistenceError> {
        let record = WebhookRecord {
            webhook_id: WebhookId::new(),
            org_id,
            url: url.to_string(),
            events,
            secret: secret.to_string(),
            description: description.map(|s| s.to_string()),
            active: true,
            created_at: Utc::now(),
        };

        let events: Vec<String> = record
            .events
            .iter()
            .map(|e| e.as_str().to_string())
            .collect();

        let query = self.ks.stmt("INSERT INTO {ks}.webhooks (
                org_id, webhook_id, url, events, secret, description, active, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
        self.ks.session()
            .query_unpaged(
                query,
                (
                    record.org_id.0,
                    record.webhook_id.0,
                    record.url.as_str(),
                    &events,
                    record.secret.as_str(),
                    record.description.as_deref(),
                    record.active,
                    record.created_at.timestamp_millis(),
                ),
            )
            .await?;
        Ok(record)
    }

    pub async fn get(
        &self,
        org_id: OrgId,
        webhook_id: WebhookId,
    ) -> Result<WebhookRecord, PersistenceError> {
        self.list(org_id)
            .await?
            .into_iter()
            .find(|w| w.webhook_id == webhook_id)
            .ok_or(PersistenceError::NotFound)
    }

    pub async fn list(&self, org_id: OrgId) -> Result<Vec<WebhookRecord>, PersistenceError> {
        let query = self.ks.stmt("SELECT org_id, webhook_id, url, events, secret, description, active, created_at
             FROM {ks}.webhooks WHERE org_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0,))
            .await?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (org_id, webhook_id, url, events, secret, description, active, created_at): (
                    Uuid,
                    Uuid,
                    String,
                    Option<Vec<String>>,
                    String,
                    Option<String>,
                    bool,
                    i64,
                ) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                out.push(WebhookRecord {
                    webhook_id: WebhookId(webhook_id),
                    org_id: OrgId(org_id),
                    url,
                    events: events
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|e| WebhookEvent::parse(e))
                        .collect(),
                    secret,
                    description,
                    active,
                    created_at: DateTime::from_timestamp_millis(created_at)
                        .unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(out)
    }

    pub async fn set_active(
        &self,
        org_id: OrgId,
        webhook_id: WebhookId,
        active: bool,
    ) -> Result<(), PersistenceError> {
        self.get(org_id, webhook_id).await?;

        let query = self.ks.stmt("UPDATE {ks}.webhooks SET active = ? WHERE org_id = ? AND webhook_id = ?");
        self.ks.session()
            .query_unpaged(query, (active, org_id.0, webhook_id.0))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, org_id: OrgId, webhook_id: WebhookId) -> Result<(), PersistenceError> {
        self.get(org_id, webhook_id).await?;

        let query = self.ks.stmt("DELETE FROM {ks}.webhooks WHERE org_id = ? AND webhook_id = ?");
        self.ks.session()
            .query_unpaged(query, (org_id.0, webhook_id.0))
            .await?;
        Ok(())
    }

    /// Record (or update) a delivery trail row
    pub async fn record_delivery(&self, row: &WebhookDeliveryRow) -> Result<(), PersistenceError> {
        let query = self.ks.stmt("INSERT INTO {ks}.webhook_deliveries (
                org_id, webhook_id, delivery_id, event_type, payload,
                attempt_count, next_attempt_at, last_status, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)");
        self.ks.session()
            .query_unpaged(
                query,
                (
                    row.org_id.0,
                    row.webhook_id.0,
                    row.delivery_id,
                    row.event_type.as_str(),
                    row.payload.as_str(),
                    row.attempt_count,
                    row.next_attempt_at.map(|t| t.timestamp_millis()),
                    row.last_status.as_deref(),
                    row.created_at.timestamp_millis(),
                ),
            )
            .await?;
        Ok(())
    }
}
