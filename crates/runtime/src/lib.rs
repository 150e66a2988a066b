//! Toolwarden verification engine
//!
//! Verifies MCP tool calls and tool responses against security signatures
//! before they reach the server or the client. Deterministic predicates and
//! an LLM verifier produce per-signature verdicts that are merged into one
//! decision; blocked operations can be escalated to a human.

pub mod config;
pub mod escalation;
pub mod llm;
pub mod registry;
pub mod reporter;
pub mod signatures;
pub mod types;
pub mod verifier;

pub use config::{ConfigError, LlmProviderKind, ScanMode, Settings};
pub use escalation::{EscalationChannel, SecurityAlertResponse};
pub use llm::{LlmTransport, LlmVerificationClient};
pub use registry::{ToolDescriptor, ToolIndex, ToolRegistry};
pub use reporter::{
    ChannelReporter, CompositeReporter, InMemoryScanRecordSink, JsonLinesReporter,
    MemoryReporter, NullReporter, ReporterEvent, ScanRecordSink, ScanReporter, SecurityAlert,
};
pub use signatures::{
    DeterministicExecutor, NativePredicates, PredicateEvaluator, Signature, SignatureStore,
};
pub use types::*;
pub use verifier::{VerificationContext, Verifier};
