//! QA criteria and evaluation store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use callweave_core::{CallId, OrgId};

use crate::{Keyspace, PersistenceError};

/// A scoring criterion configured per tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaCriterion {
    pub criterion_id: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub description: Option<String>,
    pub weight: f32,
    pub created_at: DateTime<Utc>,
}

/// A scored evaluation of one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaEvaluation {
    pub evaluation_id: Uuid,
    pub org_id: OrgId,
    pub call_id: CallId,
    pub evaluator: String,
    /// criterion name -> score
    pub scores: HashMap<String, f32>,
    pub total_score: f32,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// QA store
#[derive(Clone)]
pub struct QaStore {
    ks: Keyspace,
}

impl QaStore {
    pub fn new(ks: Keyspace) -> Self {
        Self { ks }
    }

    pub async fn create_criterion(
        &self,
        org_id: OrgId,
        name: &str,
        description: Option<&str>,
        weight: f32,
    ) -> Result<QaCriterion, PersistenceError> {
        let criterion = QaCriterion {
            criterion_id: Uuid::new_v4(),
            org_id,
            name: name.to_string(),
            description: description.map(|s| s.to_string()),
            weight,
            created_at: Utc::now(),
        };

        let query = self.ks.stmt("INSERT INTO {ks}.qa_criteria (org_id, criterion_id, name, description, weight, created_at)
             VALUES (?, ?, ?, ?, ?, ?)");
        self.ks.session()
            .query_unpaged(
                query,
                (
                    criterion.org_id.0,
                    criterion.criterion_id,
                    criterion.name.as_str(),
                    criterion.description.as_deref(),
                    criterion.weight,
                    criterion.created_at.timestamp_millis(),
                ),
            )
            .await?;
        Ok(criterion)
    }

    pub async fn list_criteria(&self, org_id: OrgId) -> Result<Vec<QaCriterion>, PersistenceError> {
        let query = self.ks.stmt("SELECT org_id, criterion_id, name, description, weight, created_at
             FROM {ks}.qa_criteria WHERE org_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0,))
            .await?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (org_id, criterion_id, name, description, weight, created_at): (
                    Uuid,
                    Uuid,
                    String,
                    Option<String>,
                    f32,
                    i64,
                ) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                out.push(QaCriterion {
                    criterion_id,
                    org_id: OrgId(org_id),
                    name,
                    description,
                    weight,
                    created_at: DateTime::from_timestamp_millis(created_at)
                        .unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(out)
    }

    /// Store an evaluation; the weighted total is computed here
    pub async fn create_evaluation(
        &self,
        org_id: OrgId,
        call_id: CallId,
        evaluator: &str,
        scores: HashMap<String, f32>,
        notes: Option<&str>,
    ) -> Result<QaEvaluation, PersistenceError> {
        let criteria = self.list_criteria(org_id).await?;
        let total_score = weighted_total(&scores, &criteria);

        let evaluation = QaEvaluation {
            evaluation_id: Uuid::new_v4(),
            org_id,
            call_id,
            evaluator: evaluator.to_string(),
            scores,
            total_score,
            notes: notes.map(|s| s.to_string()),
            created_at: Utc::now(),
        };

        let query = self.ks.stmt("INSERT INTO {ks}.qa_evaluations (
                org_id, evaluation_id, call_id, evaluator, scores,
                total_score, notes, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)");
        self.ks.session()
            .query_unpaged(
                query,
                (
                    evaluation.org_id.0,
                    evaluation.evaluation_id,
                    evaluation.call_id.0,
                    evaluation.evaluator.as_str(),
                    &evaluation.scores,
                    evaluation.total_score,
                    evaluation.notes.as_deref(),
                    evaluation.created_at.timestamp_millis(),
                ),
            )
            .await?;
        Ok(evaluation)
    }

    pub async fn list_evaluations(
        &self,
        org_id: OrgId,
    ) -> Result<Vec<QaEvaluation>, PersistenceError> {
        let query = self.ks.stmt("SELECT org_id, evaluation_id, call_id, evaluator, scores,
                    total_score, notes, created_at
             FROM {ks}.qa_evaluations WHERE org_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0,))
            .await?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (org_id, evaluation_id, call_id, evaluator, scores, total_score, notes, created_at): (
                    Uuid,
                    Uuid,
                    Uuid,
                    String,
                    Option<HashMap<String, f32>>,
                    f32,
                    Option<String>,
                    i64,
                ) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                out.push(QaEvaluation {
                    evaluation_id,
                    org_id: OrgId(org_id),
                    call_id: CallId(call_id),
                    evaluator,
                    scores: scores.unwrap_or_default(),
                    total_score,
                    notes,
                    created_at: DateTime::from_timestamp_millis(created_at)
                        .unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(out)
    }
}

/// Weighted mean of the scored criteria; unknown criteria score unweighted
fn weighted_total(scores: &HashMap<String, f32>, criteria: &[QaCriterion]) -> f32 {
    if scores.is_empty() {
        return 0.0;
    }

    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for (name, score) in scores {
        let weight = criteria
            .iter()
            .find(|c| &c.name == name)
            .map(|c| c.weight)
            .unwrap_or(1.0);
        total += score * weight;
        weight_sum += weight;
    }

    if weight_sum > 0.0 {
        total / weight_sum
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criterion(name: &str, weight: f32) -> QaCriterion {
        QaCriterion {
            criterion_id: Uuid::new_v4(),
            org_id: OrgId::new(),
            name: name.to_string(),
            description: None,
            weight,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_weighted_total() {
        let criteria = vec![criterion("greeting", 1.0), criterion("resolution", 3.0)];
        let scores: HashMap<String, f32> =
            [("greeting".to_string(), 4.0), ("resolution".to_string(), 2.0)]
                .into_iter()
                .collect();

        // (4*1 + 2*3) / 4 = 2.5
        assert!((weighted_total(&scores, &criteria) - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_criterion_defaults_to_unit_weight() {
        let scores: HashMap<String, f32> = [("improv".to_string(), 3.0)].into_iter().collect();
        assert!((weighted_total(&scores, &[]) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_scores() {
        assert_eq!(weighted_total(&HashMap::new(), &[]), 0.0);
    }
}
