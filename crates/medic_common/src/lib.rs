//! Medic Common - Diagnostic core for Medic
//!
//! Evidence-driven troubleshooting of end-user machines:
//! - Tool-use conversation loop against a reasoning service
//! - Deterministic synthesis and filtering of findings
//! - Guarded fix execution with checkpoints and rollback

pub mod collector;
pub mod collectors;
pub mod config;
pub mod events;
pub mod evidence;
pub mod fix_executor;
pub mod orchestrator;
pub mod platform;
pub mod playbook;
pub mod reasoning;
pub mod safety;
pub mod shell;
pub mod synthesis;
pub mod tools;
pub mod types;

pub use config::MedicConfig;
pub use events::{EventSink, MedicEvent, NullSink, TracingSink};
pub use fix_executor::{ExecutionLock, FixError, FixExecutionRecord, FixExecutor};
pub use orchestrator::{ChatOutcome, Conversation, Orchestrator, SessionError};
pub use playbook::{DiagnosisReport, ProblemType, SynthesisSource};
pub use reasoning::{ReasoningError, ReasoningService};
pub use types::*;
