//! Opaque identifiers
//!
//! All entities are keyed by 128-bit ids. Newtypes keep org/call/agent ids
//! from being swapped at call sites; the wire form is the uuid string.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! impl_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

impl_id!(
    /// Tenant root identifier
    OrgId
);
impl_id!(
    /// Virtual agent identifier
    AgentId
);
impl_id!(
    /// Call (conversation) identifier
    CallId
);
impl_id!(
    /// Recording artifact identifier
    RecordingId
);
impl_id!(
    /// API token identifier
    TokenId
);
impl_id!(
    /// Webhook subscription identifier
    WebhookId
);
