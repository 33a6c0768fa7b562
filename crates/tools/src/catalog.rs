//! Tool kinds and typed arguments

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The closed set of tool kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    TransferToAgent,
    ScheduleCallback,
    LookupCustomer,
    GetAccountBalance,
    CancelService,
    UpdateContactInfo,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::TransferToAgent,
        ToolKind::ScheduleCallback,
        ToolKind::LookupCustomer,
        ToolKind::GetAccountBalance,
        ToolKind::CancelService,
        ToolKind::UpdateContactInfo,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::TransferToAgent => "transfer_to_agent",
            ToolKind::ScheduleCallback => "schedule_callback",
            ToolKind::LookupCustomer => "lookup_customer",
            ToolKind::GetAccountBalance => "get_account_balance",
            ToolKind::CancelService => "cancel_service",
            ToolKind::UpdateContactInfo => "update_contact_info",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// JSON schema describing this tool's arguments
    pub fn schema(&self) -> &'static Value {
        match self {
            ToolKind::TransferToAgent => &TRANSFER_SCHEMA,
            ToolKind::ScheduleCallback => &CALLBACK_SCHEMA,
            ToolKind::LookupCustomer => &LOOKUP_SCHEMA,
            ToolKind::GetAccountBalance => &BALANCE_SCHEMA,
            ToolKind::CancelService => &CANCEL_SCHEMA,
            ToolKind::UpdateContactInfo => &CONTACT_SCHEMA,
        }
    }

    /// Catalog entry forwarded to the dialogue engine
    pub fn catalog_entry(&self) -> Value {
        json!({
            "name": self.name(),
            "parameters": self.schema(),
        })
    }
}

static TRANSFER_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "department": {"type": "string"},
            "priority": {"type": "string", "enum": ["normal", "high", "urgent"]},
        },
        "required": ["department"],
        "additionalProperties": false,
    })
});

static CALLBACK_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "phone": {"type": "string"},
            "datetime": {"type": "string"},
            "reason": {"type": "string"},
        },
        "required": ["phone", "datetime"],
        "additionalProperties": false,
    })
});

static LOOKUP_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "customer_id": {"type": "string"},
        },
        "required": ["customer_id"],
        "additionalProperties": false,
    })
});

static BALANCE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {},
        "additionalProperties": false,
    })
});

static CANCEL_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "service": {"type": "string"},
        },
        "additionalProperties": false,
    })
});

static CONTACT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "properties": {
            "email": {"type": "string"},
            "phone": {"type": "string"},
            "address": {"type": "string"},
        },
        "additionalProperties": false,
    })
});

/// Transfer priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferPriority {
    #[default]
    Normal,
    High,
    Urgent,
}

/// Callback reason is free text from the engine
pub type CallbackReason = String;

/// Typed arguments, one variant per kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolArguments {
    TransferToAgent {
        department: String,
        #[serde(default)]
        priority: TransferPriority,
    },
    ScheduleCallback {
        phone: String,
        datetime: String,
        #[serde(default)]
        reason: Option<CallbackReason>,
    },
    LookupCustomer {
        customer_id: String,
    },
    GetAccountBalance,
    CancelService {
        #[serde(default)]
        service: Option<String>,
    },
    UpdateContactInfo {
        #[serde(default)]
        email: Option<String>,
        #[serde(default)]
        phone: Option<String>,
        #[serde(default)]
        address: Option<String>,
    },
}

impl ToolArguments {
    pub fn kind(&self) -> ToolKind {
        match self {
            ToolArguments::TransferToAgent { .. } => ToolKind::TransferToAgent,
            ToolArguments::ScheduleCallback { .. } => ToolKind::ScheduleCallback,
            ToolArguments::LookupCustomer { .. } => ToolKind::LookupCustomer,
            ToolArguments::GetAccountBalance => ToolKind::GetAccountBalance,
            ToolArguments::CancelService { .. } => ToolKind::CancelService,
            ToolArguments::UpdateContactInfo { .. } => ToolKind::UpdateContactInfo,
        }
    }
}

/// A parsed, validated invocation from the dialogue stream
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub kind: ToolKind,
    pub arguments: ToolArguments,
    /// Raw arguments as received, kept for event logging
    pub raw: Value,
}

impl ToolInvocation {
    /// Parse a `{name, arguments}` pair from the engine.
    ///
    /// Unknown names and schema violations are validation errors; the
    /// catalog is closed.
    pub fn parse(name: &str, arguments: Value) -> Result<Self, crate::ToolError> {
        let kind = ToolKind::parse(name)
            .ok_or_else(|| crate::ToolError::UnknownTool(name.to_string()))?;

        let compiled = jsonschema::JSONSchema::compile(kind.schema())
            .map_err(|e| crate::ToolError::Arguments(format!("schema compile: {}", e)))?;
        if let Err(errors) = compiled.validate(&arguments) {
            let detail = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            return Err(crate::ToolError::Arguments(detail));
        }

        let parsed = match kind {
            ToolKind::TransferToAgent => ToolArguments::TransferToAgent {
                department: arguments["department"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                priority: serde_json::from_value(arguments["priority"].clone())
                    .unwrap_or_default(),
            },
            ToolKind::ScheduleCallback => ToolArguments::ScheduleCallback {
                phone: arguments["phone"].as_str().unwrap_or_default().to_string(),
                datetime: arguments["datetime"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                reason: arguments["reason"].as_str().map(|s| s.to_string()),
            },
            ToolKind::LookupCustomer => ToolArguments::LookupCustomer {
                customer_id: arguments["customer_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            },
            ToolKind::GetAccountBalance => ToolArguments::GetAccountBalance,
            ToolKind::CancelService => ToolArguments::CancelService {
                service: arguments["service"].as_str().map(|s| s.to_string()),
            },
            ToolKind::UpdateContactInfo => ToolArguments::UpdateContactInfo {
                email: arguments["email"].as_str().map(|s| s.to_string()),
                phone: arguments["phone"].as_str().map(|s| s.to_string()),
                address: arguments["address"].as_str().map(|s| s.to_string()),
            },
        };

        Ok(Self {
            kind,
            arguments: parsed,
            raw: arguments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::parse("rm_rf"), None);
    }

    #[test]
    fn test_parse_transfer() {
        let inv = ToolInvocation::parse(
            "transfer_to_agent",
            json!({"department": "billing", "priority": "high"}),
        )
        .unwrap();
        assert_eq!(inv.kind, ToolKind::TransferToAgent);
        assert_eq!(
            inv.arguments,
            ToolArguments::TransferToAgent {
                department: "billing".to_string(),
                priority: TransferPriority::High,
            }
        );
    }

    #[test]
    fn test_parse_defaults_priority() {
        let inv =
            ToolInvocation::parse("transfer_to_agent", json!({"department": "sales"})).unwrap();
        assert_eq!(
            inv.arguments,
            ToolArguments::TransferToAgent {
                department: "sales".to_string(),
                priority: TransferPriority::Normal,
            }
        );
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let err = ToolInvocation::parse("send_bitcoin", json!({})).unwrap_err();
        assert!(matches!(err, crate::ToolError::UnknownTool(_)));
    }

    #[test]
    fn test_schema_violation_rejected() {
        let err = ToolInvocation::parse("schedule_callback", json!({"phone": "+34600"})).unwrap_err();
        assert!(matches!(err, crate::ToolError::Arguments(_)));
    }

    #[test]
    fn test_extra_properties_rejected() {
        let err = ToolInvocation::parse(
            "get_account_balance",
            json!({"unexpected": true}),
        )
        .unwrap_err();
        assert!(matches!(err, crate::ToolError::Arguments(_)));
    }

    #[test]
    fn test_catalog_entries() {
        let entry = ToolKind::ScheduleCallback.catalog_entry();
        assert_eq!(entry["name"], "schedule_callback");
        assert!(entry["parameters"]["properties"]["phone"].is_object());
    }
}
