//! API token store
//!
//! Bearer tokens have the shape `cc_<prefix8>_<secret>`. The prefix is the
//! partition key, so validation is a single-partition read; only the
//! SHA-256 of the full token is stored. The raw secret is surfaced exactly
//! once, at creation. Rotation deactivates the old token and creates the
//! new one in a single logged batch.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use callweave_core::{OrgId, TokenId};

use crate::{Keyspace, PersistenceError};

const TOKEN_PREFIX_LEN: usize = 8;
const TOKEN_SECRET_LEN: usize = 32;

/// Token scopes (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    AgentRead,
    AgentWrite,
    CallsRead,
    CallsWrite,
    QaRead,
    QaWrite,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::AgentRead => "agent:read",
            Scope::AgentWrite => "agent:write",
            Scope::CallsRead => "calls:read",
            Scope::CallsWrite => "calls:write",
            Scope::QaRead => "qa:read",
            Scope::QaWrite => "qa:write",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent:read" => Some(Scope::AgentRead),
            "agent:write" => Some(Scope::AgentWrite),
            "calls:read" => Some(Scope::CallsRead),
            "calls:write" => Some(Scope::CallsWrite),
            "qa:read" => Some(Scope::QaRead),
            "qa:write" => Some(Scope::QaWrite),
            _ => None,
        }
    }
}

/// Stored token metadata; the secret itself is never retrievable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTokenRecord {
    pub token_id: TokenId,
    pub org_id: OrgId,
    pub token_prefix: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub scopes: Vec<Scope>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Resolved context for an authenticated request
#[derive(Debug, Clone)]
pub struct TokenContext {
    pub token_id: TokenId,
    pub org_id: OrgId,
    pub scopes: Vec<Scope>,
}

impl TokenContext {
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

/// Parse the `cc_<prefix8>_<secret>` shape; returns (prefix, full token)
pub fn validate_token_shape(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("cc_")?;
    let (prefix, secret) = rest.split_once('_')?;
    if prefix.len() != TOKEN_PREFIX_LEN || secret.is_empty() {
        return None;
    }
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some((prefix, raw))
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn generate_raw_token() -> (String, String) {
    let mut rng = rand::thread_rng();
    let prefix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(TOKEN_PREFIX_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    let secret: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(TOKEN_SECRET_LEN)
        .map(char::from)
        .collect();
    let raw = format!("cc_{}_{}", prefix, secret);
    (prefix, raw)
}

/// Token store
#[derive(Clone)]
pub struct TokenStore {
    ks: Keyspace,
}

impl TokenStore {
    pub fn new(ks: Keyspace) -> Self {
        Self { ks }
    }

    /// Create a token. Returns the record and the raw secret, which is not
    /// retrievable afterwards.
    pub async fn create(
        &self,
        org_id: OrgId,
        scopes: &[Scope],
        ttl_days: i64,
    ) -> Result<(ApiTokenRecord, String), PersistenceError> {
        let (prefix, raw) = generate_raw_token();
        let now = Utc::now();
        let record = ApiTokenRecord {
            token_id: TokenId::new(),
            org_id,
            token_prefix: prefix,
            token_hash: sha256_hex(&raw),
            scopes: scopes.to_vec(),
            active: true,
            created_at: now,
            expires_at: now + Duration::days(ttl_days),
            last_used_at: None,
        };

        self.insert(&record).await?;
        tracing::info!(
            org_id = %org_id,
            token_id = %record.token_id,
            prefix = %record.token_prefix,
            "API token created"
        );
        Ok((record, raw))
    }

    async fn insert(&self, record: &ApiTokenRecord) -> Result<(), PersistenceError> {
        let scopes: Vec<String> = record.scopes.iter().map(|s| s.as_str().to_string()).collect();

        let tokens_query = self.ks.stmt("INSERT INTO {ks}.api_tokens (
                token_prefix, token_id, org_id, token_hash, scopes,
                active, created_at, expires_at, last_used_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)");
        let by_org_query = self.ks.stmt("INSERT INTO {ks}.api_tokens_by_org (
                org_id, token_id, token_prefix, active, created_at, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?)");

        self.ks.session()
            .query_unpaged(
                tokens_query,
                (
                    record.token_prefix.as_str(),
                    record.token_id.0,
                    record.org_id.0,
                    record.token_hash.as_str(),
                    &scopes,
                    record.active,
                    record.created_at.timestamp_millis(),
                    record.expires_at.timestamp_millis(),
                    record.last_used_at.map(|t| t.timestamp_millis()),
                ),
            )
            .await?;

        self.ks.session()
            .query_unpaged(
                by_org_query,
                (
                    record.org_id.0,
                    record.token_id.0,
                    record.token_prefix.as_str(),
                    record.active,
                    record.created_at.timestamp_millis(),
                    record.expires_at.timestamp_millis(),
                ),
            )
            .await?;

        Ok(())
    }

    async fn get_by_prefix(&self, prefix: &str) -> Result<ApiTokenRecord, PersistenceError> {
        let query = self.ks.stmt("SELECT token_prefix, token_id, org_id, token_hash, scopes,
                    active, created_at, expires_at, last_used_at
             FROM {ks}.api_tokens WHERE token_prefix = ?");

        let result = self.ks.session()
            .query_unpaged(query, (prefix,))
            .await?;

        let Some(rows) = result.rows else {
            return Err(PersistenceError::NotFound);
        };
        let Some(row) = rows.into_iter().next() else {
            return Err(PersistenceError::NotFound);
        };

        let (
            token_prefix,
            token_id,
            org_id,
            token_hash,
            scopes,
            active,
            created_at,
            expires_at,
            last_used_at,
        ): (
            String,
            uuid::Uuid,
            uuid::Uuid,
            String,
            Option<Vec<String>>,
            bool,
            i64,
            i64,
            Option<i64>,
        ) = row
            .into_typed()
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;

        Ok(ApiTokenRecord {
            token_id: TokenId(token_id),
            org_id: OrgId(org_id),
            token_prefix,
            token_hash,
            scopes: scopes
                .unwrap_or_default()
                .iter()
                .filter_map(|s| Scope::parse(s))
                .collect(),
            active,
            created_at: DateTime::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
            expires_at: DateTime::from_timestamp_millis(expires_at).unwrap_or_else(Utc::now),
            last_used_at: last_used_at.and_then(DateTime::from_timestamp_millis),
        })
    }

    /// Validate a presented bearer token.
    ///
    /// Lookup is O(1) by prefix; the hash comparison is constant-time. An
    /// inactive or expired token is indistinguishable from a wrong secret.
    pub async fn validate(&self, raw: &str) -> Result<TokenContext, PersistenceError> {
        let Some((prefix, full)) = validate_token_shape(raw) else {
            return Err(PersistenceError::NotFound);
        };

        let record = self.get_by_prefix(prefix).await?;

        let presented_hash = sha256_hex(full);
        if !constant_time_eq(&presented_hash, &record.token_hash) {
            return Err(PersistenceError::NotFound);
        }
        if !record.active || record.expires_at <= Utc::now() {
            return Err(PersistenceError::NotFound);
        }

        // Best-effort usage touch; failures must not block the request
        let touch = self.ks.stmt("UPDATE {ks}.api_tokens SET last_used_at = ? WHERE token_prefix = ?");
        if let Err(e) = self.ks.session()
            .query_unpaged(touch, (Utc::now().timestamp_millis(), prefix))
            .await
        {
            tracing::debug!(error = %e, "last_used_at touch failed");
        }

        Ok(TokenContext {
            token_id: record.token_id,
            org_id: record.org_id,
            scopes: record.scopes,
        })
    }

    /// Rotate a token: the replacement becomes valid at the same instant
    /// the old secret stops validating.
    pub async fn rotate(
        &self,
        org_id: OrgId,
        token_id: TokenId,
        ttl_days: i64,
    ) -> Result<(ApiTokenRecord, String), PersistenceError> {
        // Locate the old token through the per-org table
        let old = self
            .list(org_id)
            .await?
            .into_iter()
            .find(|t| t.token_id == token_id)
            .ok_or(PersistenceError::NotFound)?;

        let old_record = self.get_by_prefix(&old.token_prefix).await?;
        if old_record.org_id != org_id {
            return Err(PersistenceError::NotFound);
        }

        let (prefix, raw) = generate_raw_token();
        let now = Utc::now();
        let new_record = ApiTokenRecord {
            token_id: TokenId::new(),
            org_id,
            token_prefix: prefix,
            token_hash: sha256_hex(&raw),
            scopes: old_record.scopes.clone(),
            active: true,
            created_at: now,
            expires_at: now + Duration::days(ttl_days),
            last_used_at: None,
        };

        let new_scopes: Vec<String> = new_record
            .scopes
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        // One logged batch: deactivate old, insert new
        let batch_query = self.ks.stmt("BEGIN BATCH
               UPDATE {ks}.api_tokens SET active = false WHERE token_prefix = ?;
               UPDATE {ks}.api_tokens_by_org SET active = false WHERE org_id = ? AND token_id = ?;
               INSERT INTO {ks}.api_tokens (
                   token_prefix, token_id, org_id, token_hash, scopes,
                   active, created_at, expires_at, last_used_at
               ) VALUES (?, ?, ?, ?, ?, true, ?, ?, null);
               INSERT INTO {ks}.api_tokens_by_org (
                   org_id, token_id, token_prefix, active, created_at, expires_at
               ) VALUES (?, ?, ?, true, ?, ?);
             APPLY BATCH");

        self.ks.session()
            .query_unpaged(
                batch_query,
                (
                    old_record.token_prefix.as_str(),
                    org_id.0,
                    token_id.0,
                    new_record.token_prefix.as_str(),
                    new_record.token_id.0,
                    org_id.0,
                    new_record.token_hash.as_str(),
                    &new_scopes,
                    new_record.created_at.timestamp_millis(),
                    new_record.expires_at.timestamp_millis(),
                    org_id.0,
                    new_record.token_id.0,
                    new_record.token_prefix.as_str(),
                    new_record.created_at.timestamp_millis(),
                    new_record.expires_at.timestamp_millis(),
                ),
            )
            .await?;

        tracing::info!(
            org_id = %org_id,
            old_token = %token_id,
            new_token = %new_record.token_id,
            "API token rotated"
        );
        Ok((new_record, raw))
    }

    /// Token summaries for one org (prefix-searchable, no hashes)
    pub async fn list(&self, org_id: OrgId) -> Result<Vec<TokenSummary>, PersistenceError> {
        let query = self.ks.stmt("SELECT token_id, token_prefix, active, created_at, expires_at
             FROM {ks}.api_tokens_by_org WHERE org_id = ?");

        let result = self.ks.session()
            .query_unpaged(query, (org_id.0,))
            .await?;

        let mut out = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (token_id, token_prefix, active, created_at, expires_at): (
                    uuid::Uuid,
                    String,
                    bool,
                    i64,
                    i64,
                ) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                out.push(TokenSummary {
                    token_id: TokenId(token_id),
                    token_prefix,
                    active,
                    created_at: DateTime::from_timestamp_millis(created_at)
                        .unwrap_or_else(Utc::now),
                    expires_at: DateTime::from_timestamp_millis(expires_at)
                        .unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(out)
    }
}

/// Listing row without the hash
#[derive(Debug, Clone, Serialize)]
pub struct TokenSummary {
    pub token_id: TokenId,
    pub token_prefix: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shape() {
        assert!(validate_token_shape("cc_abcd1234_s3cr3ts3cr3t").is_some());
        assert!(validate_token_shape("cc_short_s3cr3t").is_none());
        assert!(validate_token_shape("xx_abcd1234_s3cr3t").is_none());
        assert!(validate_token_shape("cc_abcd1234_").is_none());
        assert!(validate_token_shape("cc_abcd-234_s3cr3t").is_none());
    }

    #[test]
    fn test_generated_token_parses() {
        let (prefix, raw) = generate_raw_token();
        let (parsed_prefix, full) = validate_token_shape(&raw).unwrap();
        assert_eq!(parsed_prefix, prefix);
        assert_eq!(full, raw);
    }

    #[test]
    fn test_generated_tokens_unique() {
        let (_, a) = generate_raw_token();
        let (_, b) = generate_raw_token();
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let h = sha256_hex("cc_abcd1234_secret");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_scope_round_trip() {
        for scope in [
            Scope::AgentRead,
            Scope::AgentWrite,
            Scope::CallsRead,
            Scope::CallsWrite,
            Scope::QaRead,
            Scope::QaWrite,
        ] {
            assert_eq!(Scope::parse(scope.as_str()), Some(scope));
        }
        assert_eq!(Scope::parse("admin:all"), None);
    }

    #[test]
    fn test_context_scope_check() {
        let ctx = TokenContext {
            token_id: TokenId::new(),
            org_id: OrgId::new(),
            scopes: vec![Scope::CallsRead],
        };
        assert!(ctx.has_scope(Scope::CallsRead));
        assert!(!ctx.has_scope(Scope::CallsWrite));
    }
}
