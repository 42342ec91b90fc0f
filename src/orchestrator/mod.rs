//! Step orchestration modules.
//!
//! Covers session locking, the agent step contract, the ordered step
//! pipeline, and the blocking/streaming execution bridge.

pub mod bridge;
pub mod lock_manager;
pub mod pipeline;
pub mod step;

pub use bridge::{EventStream, ExecutionBridge, FragmentSink};
pub use lock_manager::{SessionGuard, SessionLockManager};
pub use pipeline::{StepPipeline, StepReply};
pub use step::{AgentStep, StepOutput, StepRequest};
