//! Closed tool catalog
//!
//! The dialogue engine can invoke exactly six tools. Tool kinds are a
//! tagged variant rather than string-keyed dynamic dispatch; each kind has
//! a typed argument struct, a JSON schema for validation, and one
//! registered handler. Execution is timeout-wrapped.

mod catalog;
mod registry;

pub use catalog::{
    CallbackReason, ToolArguments, ToolInvocation, ToolKind, TransferPriority,
};
pub use registry::{ToolError, ToolHandler, ToolOutput, ToolRegistry};
