#![forbid(unsafe_code)]

//! Conversational session runtime.
//!
//! Resumes per-session conversation state from a durable checkpoint file,
//! serializes steps per session, keeps history within a token budget by
//! summarizing older turns, caps side-effecting actions, and bridges a
//! step's incremental output to blocking or streaming callers.

pub mod accountant;
pub mod budget;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
