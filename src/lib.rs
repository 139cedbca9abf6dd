//! DeskVisor - session & VM lifecycle orchestrator for ephemeral remote desktops
//!
//! This library provides the control plane that provisions, isolates,
//! monitors and tears down one cloud VM per user session, preferring spot
//! capacity with on-demand fallback and guaranteeing leak-free cleanup.
//!
//! # Modules
//!
//! - `session` - session state machine and the `SessionManager` contract
//! - `vm` - VM handles and the provisioning/health/destroy controller
//! - `isolation` - four-layer session separation validation
//! - `cost` - capacity planning, spend estimation, right-sizing advice
//! - `cleanup` - phased teardown with tiered retries and the orphan sweep
//! - `backend` - cloud capability traits plus the `SimBackend` used in tests
//! - `retry` - the primary/fallback/emergency escalation ladder
//! - `audit` - append-only trail of lifecycle decisions
//! - `metrics` - Prometheus metrics for observability
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use deskvisor::{Config, SessionManager, SessionRequest, SimBackend, TracingAuditSink};
//!
//! let manager = SessionManager::new(
//!     Config::default(),
//!     Arc::new(SimBackend::new()),
//!     Arc::new(TracingAuditSink),
//! )?;
//! manager.start();
//!
//! let session = manager.create_session(SessionRequest::new("user-1")).await?;
//! ```

pub mod audit;
pub mod backend;
pub mod cleanup;
pub mod config;
pub mod cost;
pub mod error;
pub mod isolation;
pub mod metrics;
pub mod retry;
pub mod session;
pub mod vm;

// Re-export commonly used types at crate root for convenience
pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use backend::{CloudBackend, SimBackend};
pub use config::Config;
pub use error::{OrchestratorError, Result};
pub use session::{SessionManager, SessionRequest, SessionSnapshot, SessionState, TerminationReason};
pub use vm::{VmHandle, VmState};
