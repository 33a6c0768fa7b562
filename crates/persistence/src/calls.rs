//! Call, turn and event store
//!
//! Turns are append-only and clustered in order within their call. Per-turn
//! metric rows feed the call summary endpoint; aggregation itself is a pure
//! function so it is testable without a cluster.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use callweave_core::{AgentId, CallEvent, CallId, CallStatus, OrgId, Turn, TurnRole};

use crate::{Keyspace, PersistenceError};

/// A persisted per-turn metrics row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetricsRow {
    pub turn_index: i32,
    pub role: TurnRole,
    pub stt_ms: Option<i64>,
    pub llm_ms: Option<i64>,
    pub tts_ms: Option<i64>,
    pub denoise_ms: Option<i64>,
    pub total_ms: Option<i64>,
    pub sentiment_label: Option<String>,
    pub sentiment_score: Option<f32>,
    pub confidence: f32,
    pub was_interrupted: bool,
    pub corrections_count: i32,
}

/// Aggregated metrics over a window of calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub days: i64,
    pub total_calls: u64,
    pub total_turns: u64,
    pub interruptions: u64,
    pub avg_stt_ms: Option<f64>,
    pub avg_llm_ms: Option<f64>,
    pub avg_tts_ms: Option<f64>,
    pub avg_total_ms: Option<f64>,
    pub avg_sentiment_score: Option<f64>,
    pub avg_confidence: Option<f64>,
}

impl MetricsSummary {
    /// Fold turn rows from `total_calls` calls into one summary
    pub fn aggregate(days: i64, total_calls: u64, rows: &[TurnMetricsRow]) -> Self {
        fn avg_of(values: impl Iterator<Item = f64>) -> Option<f64> {
            let collected: Vec<f64> = values.collect();
            if collected.is_empty() {
                None
            } else {
                Some(collected.iter().sum::<f64>() / collected.len() as f64)
            }
        }

        Self {
            days,
            total_calls,
            total_turns: rows.len() as u64,
            interruptions: rows.iter().filter(|r| r.was_interrupted).count() as u64,
            avg_stt_ms: avg_of(rows.iter().filter_map(|r| r.stt_ms).map(|v| v as f64)),
            avg_llm_ms: avg_of(rows.iter().filter_map(|r| r.llm_ms).map(|v| v as f64)),
            avg_tts_ms: avg_of(rows.iter().filter_map(|r| r.tts_ms).map(|v| v as f64)),
            avg_total_ms: avg_of(rows.iter().filter_map(|r| r.total_ms).map(|v| v as f64)),
            avg_sentiment_score: avg_of(
                rows.iter().filter_map(|r| r.sentiment_score).map(|v| v as f64),
            ),
            avg_confidence: avg_of(rows.iter().map(|r| r.confidence as f64)),
        }
    }
}

/// Call store
#[derive(Clone)]
pub struct CallStore {
    ks: Keyspace,
}

impl CallStore {
    pub fn new(ks: Keyspace) -> Self {
        Self { ks }
    }

    pub async fn create(
        &self,
        org_id: OrgId,
        call_id: CallId,
        agent_id: AgentId,
        caller: &str,
    ) -> Result<(), PersistenceError> {
        let query = self.ks.stmt("INSERT INTO {ks}.calls (org_id, call_id, agent_id, caller, started_at, ended_at, status)
             VALUES (?, ?, ?, ?, ?, null, ?)");
        self.ks.session()
            .query_unpaged(
                query,
                (
                    org_id.0,
                    call_id.0,
                    agent_id.0,
                    caller,
                    Utc::now().timestamp_millis(),
                    "active",
                ),
            )
            .await?;
        Ok(())
    }

    pub async fn set_status(
        &self,
        org_id: OrgId,
        call_id: CallId,
        status: CallStatus,
        ended: bool,
    ) -> Result<(), PersistenceError> {
        let status = match status {
            CallStatus::Active => "active",
            CallStatus::Ended => "ended",
            CallStatus::Error => "error",
        };

        let query = if ended {
            self.ks.stmt("UPDATE {ks}.calls SET status = ?, ended_at = ? WHERE org_id = ? AND call_id = ?")
        } else {
            self.ks.stmt("UPDATE {ks}.calls SET status = ? WHERE org_id = ? AND call_id = ?")
        };

        if ended {
            self.ks.session()
                .query_unpaged(
                    query,
                    (status, Utc::now().timestamp_millis(), org_id.0, call_id.0),
                )
                .await?;
        } else {
            self.ks.session()
                .query_unpaged(query, (status, org_id.0, call_id.0))
                .await?;
        }
        Ok(())
    }

    /// Fetch one call, org-scoped
    pub async fn get(
        &self,
        org_id: OrgId,
        call_id: CallId,
    ) -> Result<CallRow, PersistenceError> {
        let query = self.ks.stmt("SELECT org_id, call_id, agent_id, caller, started_at, ended_at, status
             FROM {ks}.calls WHERE org_id = ? AND call_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0, call_id.0))
            .await?;

        let Some(rows) = result.rows else {
            return Err(PersistenceError::NotFound);
        };
        let Some(row) = rows.into_iter().next() else {
            return Err(PersistenceError::NotFound);
        };

        let (org_id, call_id, agent_id, caller, started_at, ended_at, status): (
            Uuid,
            Uuid,
            Uuid,
            String,
            i64,
            Option<i64>,
            String,
        ) = row
            .into_typed()
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;

        Ok(CallRow {
            org_id: OrgId(org_id),
            call_id: CallId(call_id),
            agent_id: AgentId(agent_id),
            caller,
            started_at: DateTime::from_timestamp_millis(started_at).unwrap_or_else(Utc::now),
            ended_at: ended_at.and_then(DateTime::from_timestamp_millis),
            status,
        })
    }

    /// All calls for one org (partition scan)
    pub async fn list(&self, org_id: OrgId) -> Result<Vec<CallRow>, PersistenceError> {
        let query = self.ks.stmt("SELECT org_id, call_id, agent_id, caller, started_at, ended_at, status
             FROM {ks}.calls WHERE org_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0,))
            .await?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (org_id, call_id, agent_id, caller, started_at, ended_at, status): (
                    Uuid,
                    Uuid,
                    Uuid,
                    String,
                    i64,
                    Option<i64>,
                    String,
                ) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                out.push(CallRow {
                    org_id: OrgId(org_id),
                    call_id: CallId(call_id),
                    agent_id: AgentId(agent_id),
                    caller,
                    started_at: DateTime::from_timestamp_millis(started_at)
                        .unwrap_or_else(Utc::now),
                    ended_at: ended_at.and_then(DateTime::from_timestamp_millis),
                    status,
                });
            }
        }
        Ok(out)
    }

    /// Append one turn with its metrics
    pub async fn append_turn(
        &self,
        org_id: OrgId,
        call_id: CallId,
        turn_index: i32,
        turn: &Turn,
    ) -> Result<(), PersistenceError> {
        let query = self.ks.stmt("INSERT INTO {ks}.turns (
                org_id, call_id, turn_index, role, text, started_at, ended_at,
                stt_confidence, corrections_count, sentiment_label, sentiment_score,
                stt_ms, llm_ms, tts_ms, denoise_ms, total_ms, was_interrupted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");

        let role = match turn.role {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        };

        #[derive(scylla::SerializeRow)]
        struct InsertTurnRow<'a> {
            org_id: Uuid,
            call_id: Uuid,
            turn_index: i32,
            role: &'a str,
            text: &'a str,
            started_at: i64,
            ended_at: Option<i64>,
            stt_confidence: f32,
            corrections_count: i32,
            sentiment_label: Option<&'a str>,
            sentiment_score: Option<f32>,
            stt_ms: Option<i64>,
            llm_ms: Option<i64>,
            tts_ms: Option<i64>,
            denoise_ms: Option<i64>,
            total_ms: Option<i64>,
            was_interrupted: bool,
        }

        self.ks.session()
            .query_unpaged(
                query,
                InsertTurnRow {
                    org_id: org_id.0,
                    call_id: call_id.0,
                    turn_index,
                    role,
                    text: turn.text.as_str(),
                    started_at: turn.started_at.timestamp_millis(),
                    ended_at: turn.ended_at.map(|t| t.timestamp_millis()),
                    stt_confidence: turn.stt_confidence,
                    corrections_count: turn.corrections.len() as i32,
                    sentiment_label: turn.sentiment_label.as_deref(),
                    sentiment_score: turn.sentiment_score,
                    stt_ms: turn.latencies.stt_ms.map(|v| v as i64),
                    llm_ms: turn.latencies.llm_ms.map(|v| v as i64),
                    tts_ms: turn.latencies.tts_ms.map(|v| v as i64),
                    denoise_ms: turn.latencies.denoise_ms.map(|v| v as i64),
                    total_ms: turn.latencies.total_ms.map(|v| v as i64),
                    was_interrupted: turn.was_interrupted,
                },
            )
            .await?;
        Ok(())
    }

    /// Turn metric rows for one call, in turn order
    pub async fn turn_metrics(
        &self,
        org_id: OrgId,
        call_id: CallId,
    ) -> Result<Vec<TurnMetricsRow>, PersistenceError> {
        let query = self.ks.stmt("SELECT turn_index, role, stt_confidence, corrections_count,
                    sentiment_label, sentiment_score, stt_ms, llm_ms, tts_ms,
                    denoise_ms, total_ms, was_interrupted
             FROM {ks}.turns WHERE org_id = ? AND call_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0, call_id.0))
            .await?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (
                    turn_index,
                    role,
                    stt_confidence,
                    corrections_count,
                    sentiment_label,
                    sentiment_score,
                    stt_ms,
                    llm_ms,
                    tts_ms,
                    denoise_ms,
                    total_ms,
                    was_interrupted,
                ): (
                    i32,
                    String,
                    f32,
                    i32,
                    Option<String>,
                    Option<f32>,
                    Option<i64>,
                    Option<i64>,
                    Option<i64>,
                    Option<i64>,
                    Option<i64>,
                    bool,
                ) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;

                out.push(TurnMetricsRow {
                    turn_index,
                    role: if role == "assistant" {
                        TurnRole::Assistant
                    } else {
                        TurnRole::User
                    },
                    stt_ms,
                    llm_ms,
                    tts_ms,
                    denoise_ms,
                    total_ms,
                    sentiment_label,
                    sentiment_score,
                    confidence: stt_confidence,
                    was_interrupted,
                    corrections_count,
                });
            }
        }
        Ok(out)
    }

    /// Append one structured stage event
    pub async fn append_event(&self, event: &CallEvent) -> Result<(), PersistenceError> {
        let query = self.ks.stmt("INSERT INTO {ks}.call_events (
                org_id, call_id, created_at, event_id, stage,
                input_digest, output_digest, latency_ms, model_id, parameters_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");

        self.ks.session()
            .query_unpaged(
                query,
                (
                    event.org_id.0,
                    event.conversation_id.0,
                    event.timestamp.timestamp_millis(),
                    Uuid::new_v4(),
                    event.stage.as_str(),
                    event.input_digest.as_deref(),
                    event.output_digest.as_deref(),
                    event.latency_ms.map(|v| v as i64),
                    event.model_id.as_deref(),
                    event.parameters.as_ref().map(|p| p.to_string()),
                ),
            )
            .await?;
        Ok(())
    }

    /// Metrics summary across the last `days` days
    pub async fn metrics_summary(
        &self,
        org_id: OrgId,
        days: i64,
    ) -> Result<MetricsSummary, PersistenceError> {
        let cutoff = Utc::now() - Duration::days(days);
        let calls: Vec<CallRow> = self
            .list(org_id)
            .await?
            .into_iter()
            .filter(|c| c.started_at >= cutoff)
            .collect();

        let mut rows = Vec::new();
        for call in &calls {
            rows.extend(self.turn_metrics(org_id, call.call_id).await?);
        }

        Ok(MetricsSummary::aggregate(days, calls.len() as u64, &rows))
    }
}

/// One row of the calls table
#[derive(Debug, Clone, Serialize)]
pub struct CallRow {
    pub org_id: OrgId,
    pub call_id: CallId,
    pub agent_id: AgentId,
    pub caller: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        stt: Option<i64>,
        total: Option<i64>,
        score: Option<f32>,
        interrupted: bool,
    ) -> TurnMetricsRow {
        TurnMetricsRow {
            turn_index: 0,
            role: TurnRole::User,
            stt_ms: stt,
            llm_ms: None,
            tts_ms: None,
            denoise_ms: None,
            total_ms: total,
            sentiment_label: None,
            sentiment_score: score,
            confidence: 0.8,
            was_interrupted: interrupted,
            corrections_count: 0,
        }
    }

    #[test]
    fn test_aggregate_empty() {
        let summary = MetricsSummary::aggregate(7, 0, &[]);
        assert_eq!(summary.total_calls, 0);
        assert_eq!(summary.total_turns, 0);
        assert!(summary.avg_stt_ms.is_none());
    }

    #[test]
    fn test_aggregate_skips_missing_stages() {
        let rows = vec![
            row(Some(800), Some(2000), Some(-0.5), true),
            row(None, Some(1000), None, false),
        ];
        let summary = MetricsSummary::aggregate(7, 2, &rows);

        assert_eq!(summary.total_calls, 2);
        assert_eq!(summary.total_turns, 2);
        assert_eq!(summary.interruptions, 1);
        // Only one row carried stt_ms; its value is the average
        assert_eq!(summary.avg_stt_ms, Some(800.0));
        assert_eq!(summary.avg_total_ms, Some(1500.0));
        assert_eq!(summary.avg_sentiment_score, Some(-0.5));
        assert!((summary.avg_confidence.unwrap() - 0.8).abs() < 1e-9);
    }
}
