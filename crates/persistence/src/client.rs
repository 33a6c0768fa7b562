//! Cluster connection and keyspace handle
//!
//! Stores share one `Keyspace`: the session plus the keyspace name from
//! `ScyllaSettings`. Statement templates use a `{ks}` placeholder that
//! `stmt` resolves, so table names stay readable at the call site and no
//! store carries the keyspace around separately.

use scylla::{Session, SessionBuilder};
use std::sync::Arc;

use callweave_config::ScyllaSettings;

use crate::error::PersistenceError;
use crate::schema;

/// Shared handle to this deployment's keyspace
#[derive(Clone)]
pub struct Keyspace {
    session: Arc<Session>,
    name: Arc<str>,
}

impl Keyspace {
    /// Connect to the cluster and ensure the keyspace and tables exist
    pub async fn connect(settings: &ScyllaSettings) -> Result<Self, PersistenceError> {
        tracing::info!(
            hosts = ?settings.hosts,
            keyspace = %settings.keyspace,
            "Connecting to ScyllaDB"
        );

        let session = SessionBuilder::new()
            .known_nodes(&settings.hosts)
            .build()
            .await?;

        let keyspace = Self {
            session: Arc::new(session),
            name: settings.keyspace.as_str().into(),
        };

        schema::create_keyspace(&keyspace, settings.replication_factor).await?;
        schema::create_tables(&keyspace).await?;
        tracing::info!(keyspace = %keyspace.name, "Schema ensured");

        Ok(keyspace)
    }

    /// Resolve the `{ks}` placeholder in a statement template
    pub fn stmt(&self, template: &str) -> String {
        template.replace("{ks}", &self.name)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    // Connecting needs a running cluster, so only the statement templating
    // is exercised offline.

    #[test]
    fn test_stmt_resolves_every_placeholder() {
        let resolved = "SELECT * FROM {ks}.calls WHERE org_id = ?".replace("{ks}", "callweave");
        assert_eq!(resolved, "SELECT * FROM callweave.calls WHERE org_id = ?");

        let multi = "BEGIN BATCH UPDATE {ks}.a; UPDATE {ks}.b; APPLY BATCH".replace("{ks}", "cw");
        assert!(!multi.contains("{ks}"));
    }
}
