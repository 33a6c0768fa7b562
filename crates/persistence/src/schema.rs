//! Schema creation
//!
//! Every tenant-owned table carries org_id in its partition key so reads
//! are org-scoped at the data layer, not just at the API.

use crate::client::Keyspace;
use crate::error::PersistenceError;

/// Create the keyspace if it doesn't exist
pub async fn create_keyspace(ks: &Keyspace, replication_factor: u8) -> Result<(), PersistenceError> {
    let query = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        ks.name(),
        replication_factor
    );

    ks.session()
        .query_unpaged(query, &[])
        .await
        .map_err(|e| PersistenceError::Schema(format!("Failed to create keyspace: {}", e)))?;

    Ok(())
}

/// Create all required tables
pub async fn create_tables(ks: &Keyspace) -> Result<(), PersistenceError> {
    let tables: &[(&str, &str)] = &[
        (
            "organizations",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.organizations (
                    org_id UUID,
                    name TEXT,
                    plan TEXT,
                    max_agents INT,
                    max_concurrent_calls INT,
                    active BOOLEAN,
                    settings MAP<TEXT, TEXT>,
                    created_at BIGINT,
                    PRIMARY KEY (org_id)
                )
                "#,
        ),
        (
            "api_tokens",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.api_tokens (
                    token_prefix TEXT,
                    token_id UUID,
                    org_id UUID,
                    token_hash TEXT,
                    scopes SET<TEXT>,
                    active BOOLEAN,
                    created_at BIGINT,
                    expires_at BIGINT,
                    last_used_at BIGINT,
                    PRIMARY KEY (token_prefix)
                )
                "#,
        ),
        (
            "api_tokens_by_org",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.api_tokens_by_org (
                    org_id UUID,
                    token_id UUID,
                    token_prefix TEXT,
                    active BOOLEAN,
                    created_at BIGINT,
                    expires_at BIGINT,
                    PRIMARY KEY ((org_id), token_id)
                )
                "#,
        ),
        (
            "agents",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.agents (
                    org_id UUID,
                    agent_id UUID,
                    status TEXT,
                    voice_profile TEXT,
                    context_profile TEXT,
                    config MAP<TEXT, TEXT>,
                    created_at BIGINT,
                    PRIMARY KEY ((org_id), agent_id)
                )
                "#,
        ),
        (
            "calls",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.calls (
                    org_id UUID,
                    call_id UUID,
                    agent_id UUID,
                    caller TEXT,
                    started_at BIGINT,
                    ended_at BIGINT,
                    status TEXT,
                    PRIMARY KEY ((org_id), call_id)
                )
                "#,
        ),
        (
            "turns",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.turns (
                    org_id UUID,
                    call_id UUID,
                    turn_index INT,
                    role TEXT,
                    text TEXT,
                    started_at BIGINT,
                    ended_at BIGINT,
                    stt_confidence FLOAT,
                    corrections_count INT,
                    sentiment_label TEXT,
                    sentiment_score FLOAT,
                    stt_ms BIGINT,
                    llm_ms BIGINT,
                    tts_ms BIGINT,
                    denoise_ms BIGINT,
                    total_ms BIGINT,
                    was_interrupted BOOLEAN,
                    PRIMARY KEY ((org_id, call_id), turn_index)
                ) WITH CLUSTERING ORDER BY (turn_index ASC)
                "#,
        ),
        (
            "call_events",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.call_events (
                    org_id UUID,
                    call_id UUID,
                    created_at BIGINT,
                    event_id UUID,
                    stage TEXT,
                    input_digest TEXT,
                    output_digest TEXT,
                    latency_ms BIGINT,
                    model_id TEXT,
                    parameters_json TEXT,
                    PRIMARY KEY ((org_id, call_id), created_at, event_id)
                ) WITH CLUSTERING ORDER BY (created_at ASC, event_id ASC)
                "#,
        ),
        (
            "qa_criteria",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.qa_criteria (
                    org_id UUID,
                    criterion_id UUID,
                    name TEXT,
                    description TEXT,
                    weight FLOAT,
                    created_at BIGINT,
                    PRIMARY KEY ((org_id), criterion_id)
                )
                "#,
        ),
        (
            "qa_evaluations",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.qa_evaluations (
                    org_id UUID,
                    evaluation_id UUID,
                    call_id UUID,
                    evaluator TEXT,
                    scores MAP<TEXT, FLOAT>,
                    total_score FLOAT,
                    notes TEXT,
                    created_at BIGINT,
                    PRIMARY KEY ((org_id), evaluation_id)
                )
                "#,
        ),
        (
            "webhooks",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.webhooks (
                    org_id UUID,
                    webhook_id UUID,
                    url TEXT,
                    events SET<TEXT>,
                    secret TEXT,
                    description TEXT,
                    active BOOLEAN,
                    created_at BIGINT,
                    PRIMARY KEY ((org_id), webhook_id)
                )
                "#,
        ),
        (
            "webhook_deliveries",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.webhook_deliveries (
                    org_id UUID,
                    webhook_id UUID,
                    delivery_id UUID,
                    event_type TEXT,
                    payload TEXT,
                    attempt_count INT,
                    next_attempt_at BIGINT,
                    last_status TEXT,
                    created_at BIGINT,
                    PRIMARY KEY ((org_id, webhook_id), delivery_id)
                )
                "#,
        ),
        (
            "audit_log",
            r#"
                CREATE TABLE IF NOT EXISTS {ks}.audit_log (
                    org_id UUID,
                    created_at BIGINT,
                    audit_id UUID,
                    kind TEXT,
                    detail TEXT,
                    PRIMARY KEY ((org_id), created_at, audit_id)
                ) WITH CLUSTERING ORDER BY (created_at DESC, audit_id ASC)
                "#,
        ),
    ];

    for (name, template) in tables {
        ks.session()
            .query_unpaged(ks.stmt(template), &[])
            .await
            .map_err(|e| {
                PersistenceError::Schema(format!("Failed to create {} table: {}", name, e))
            })?;
    }

    Ok(())
}
