//! Persistence layer modules.

pub mod checkpoint_store;

pub use checkpoint_store::CheckpointStore;
