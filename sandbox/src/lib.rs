//! In-sandbox agent worker
//!
//! Reads one task envelope from stdin, drives an agent backend through
//! request/response rounds, prints a result frame per round on stdout, and
//! takes follow-up input from a filesystem mailbox until told to close.

pub mod backend;
pub mod intake;
pub mod worker;

pub use backend::{build_backend, AgentBackend, BackendError, BackendOptions};
pub use intake::{read_envelope, IntakeError};
pub use worker::{ExitReason, WorkerError, WorkerExit, WorkerLoop, WorkerState};
