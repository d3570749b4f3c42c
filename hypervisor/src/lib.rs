//! Hypervisor - host-side orchestrator for sandboxed agent workers
//!
//! One worker process per active conversation. The hypervisor launches it
//! with a task envelope, reads result frames off its stdout, feeds follow-up
//! input through the conversation's mailbox, and tears it down on close,
//! idle or timeout. The last known backend session per conversation is kept
//! in SQLite so a fresh worker can resume it.

pub mod api;
pub mod config;
pub mod db;
pub mod orchestrator;
pub mod outbox;
pub mod sandbox;
pub mod session_registry;
pub mod state;
pub mod supervisor;

pub use state::AppState;
