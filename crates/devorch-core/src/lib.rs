//! devorch core - guarded command execution for a developer workstation
//!
//! Lets an automated assistant run shell commands and manage background
//! services on a local machine without handing it an unrestricted shell.
//! Every command is classified by the guardrails before anything is
//! spawned; whatever is not unconditionally safe waits for a human.
//!
//! # Architecture
//!
//! 1. **Guardrails** (`guardrail`): ordered block/approve rules plus a directory allow-list
//! 2. **Approvals** (`approval`): pending decisions, one terminal outcome each
//! 3. **Executor** (`executor`): runs commands, captures output and exit codes
//! 4. **Services** (`service`): long-running processes with crash detection
//! 5. **State** (`state`): the single versioned snapshot every observer follows
//! 6. **NLP** (`nlp`): optional free-text to command translation
//!
//! [`Orchestrator`] wires them together.
//!
//! # Quick Start
//!
//! ```no_run
//! use devorch_core::{Orchestrator, OrchestratorConfig, SubmitRequest, SubmissionStatus};
//!
//! # async fn demo() -> devorch_core::Result<()> {
//! let orchestrator = Orchestrator::start(OrchestratorConfig::default()).await?;
//!
//! let submission = orchestrator
//!     .run_command(SubmitRequest::new("git push --force").with_cwd("/home/me/work/app"))
//!     .await?;
//!
//! if submission.status == SubmissionStatus::PendingApproval {
//!     if let Some(approval) = submission.approval_id {
//!         orchestrator.approve_command(&approval)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations, clippy::all)]

pub mod approval;
pub mod config;
pub mod error;
pub mod executor;
pub mod guardrail;
pub mod nlp;
pub mod notify;
pub mod orchestrator;
pub mod process;
pub mod project;
pub mod ring;
pub mod service;
pub mod state;
pub mod storage;
pub mod types;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result, ResultExt};
pub use guardrail::{GuardrailPolicy, GuardrailRule, Verdict};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, Submission, SubmissionStatus, SubmitRequest};
pub use state::{Delta, StateEvent, StateSnapshot, StateStore};
pub use types::{
    ApprovalId, CommandId, CommandRecord, CommandStatus, LogEntry, LogLevel, PendingApproval,
    ProjectProfile, Resolution, SavedCommand, Service, ServiceId, ServiceRequest, ServiceStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
