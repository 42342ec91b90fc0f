//! Session gateway.
//!
//! Maps external user and conversation identities to session keys and
//! drives the pipeline for chat, streaming chat, reset, and inspection.

pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::accountant::ActionAccountant;
use crate::budget::{ContextBudgetManager, Summarizer, TokenCounter};
use crate::models::checkpoint::MilestoneValue;
use crate::models::turn::Turn;
use crate::orchestrator::bridge::{EventStream, ExecutionBridge};
use crate::orchestrator::lock_manager::{spawn_eviction_task, SessionLockManager};
use crate::orchestrator::pipeline::{StepPipeline, StepReply};
use crate::orchestrator::step::AgentStep;
use crate::persistence::CheckpointStore;
use crate::{GlobalConfig, Result};

/// Conversation id used when a request does not name one.
pub const DEFAULT_CONVERSATION: &str = "default";

/// Derive the session key for a user's conversation.
#[must_use]
pub fn session_key(prefix: &str, user_id: &str, conversation_id: &str) -> String {
    format!("{prefix}::{user_id}::{conversation_id}")
}

fn default_conversation() -> String {
    DEFAULT_CONVERSATION.into()
}

/// Inbound chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatRequest {
    /// External user identity.
    pub user_id: String,
    /// Conversation within the user's sessions.
    #[serde(default = "default_conversation")]
    pub conversation_id: String,
    /// Message text.
    pub message: String,
}

/// Identifies a session to reset or inspect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRef {
    /// External user identity.
    pub user_id: String,
    /// Conversation within the user's sessions.
    #[serde(default = "default_conversation")]
    pub conversation_id: String,
}

/// Blocking chat reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatReply {
    /// Session key the message was routed to.
    pub session_id: String,
    /// Assistant reply text.
    pub reply: String,
}

/// Read-only view of a session's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session key.
    pub session_id: String,
    /// Milestone flags.
    pub milestones: BTreeMap<String, MilestoneValue>,
    /// Number of stored turns.
    pub message_count: usize,
    /// Executed actions.
    pub action_count: u64,
    /// Cumulative input tokens.
    pub tokens_in: u64,
    /// Cumulative output tokens.
    pub tokens_out: u64,
    /// Whether history starts with a summary turn.
    pub summarized: bool,
}

/// Builder for [`SessionGateway`].
pub struct SessionGatewayBuilder {
    config: GlobalConfig,
    step: Arc<dyn AgentStep>,
    summarizer: Option<Arc<dyn Summarizer>>,
    counter: Option<Arc<dyn TokenCounter>>,
}

impl SessionGatewayBuilder {
    /// Summarizer used by the budget cycle; without one compression is off.
    #[must_use]
    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Exact token counter preferred over the heuristic.
    #[must_use]
    pub fn token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Open the store and assemble the gateway.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the configuration is invalid.
    pub fn build(self) -> Result<SessionGateway> {
        self.config.validate()?;

        let store = Arc::new(CheckpointStore::open(self.config.store_path.clone()));
        let locks = Arc::new(SessionLockManager::from_config(&self.config.locks));
        let budget = match self.summarizer {
            Some(summarizer) if self.config.budget.enabled => {
                let manager = ContextBudgetManager::new(self.config.budget.clone(), summarizer);
                Some(match self.counter {
                    Some(counter) => manager.with_counter(counter),
                    None => manager,
                })
            }
            _ => None,
        };
        let accountant = ActionAccountant::new(&self.config.accountant);
        let pipeline = Arc::new(StepPipeline::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            budget,
            accountant,
            self.step,
        ));
        let bridge = ExecutionBridge::new(pipeline, self.config.bridge.clone());

        info!(
            store = %self.config.store_path.display(),
            global_lock = self.config.locks.global_execution_lock,
            allow_spawn = self.config.bridge.allow_spawn,
            "session gateway ready"
        );

        Ok(SessionGateway {
            config: self.config,
            store,
            locks,
            bridge,
        })
    }
}

/// Entry point used by transports.
#[derive(Debug)]
pub struct SessionGateway {
    config: GlobalConfig,
    store: Arc<CheckpointStore>,
    locks: Arc<SessionLockManager>,
    bridge: ExecutionBridge,
}

impl SessionGateway {
    /// Start building a gateway around `step`.
    #[must_use]
    pub fn builder(config: GlobalConfig, step: Arc<dyn AgentStep>) -> SessionGatewayBuilder {
        SessionGatewayBuilder {
            config,
            step,
            summarizer: None,
            counter: None,
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Checkpoint file backing this gateway.
    #[must_use]
    pub fn store_path(&self) -> &std::path::Path {
        self.store.path()
    }

    /// Shared checkpoint store.
    #[must_use]
    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Shared lock manager.
    #[must_use]
    pub fn locks(&self) -> &Arc<SessionLockManager> {
        &self.locks
    }

    /// Session key for a user's conversation.
    #[must_use]
    pub fn session_id(&self, user_id: &str, conversation_id: &str) -> String {
        session_key(&self.config.session_prefix, user_id, conversation_id)
    }

    /// Run one blocking step.
    ///
    /// With `bridge.allow_spawn = false` the step runs inline and cannot be
    /// preempted, so `deadline` is advisory: an overrun is logged and the
    /// reply is still returned, never `AppError::StepTimeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StepTimeout` (spawned mode only) or
    /// `AppError::StepExecution`.
    pub async fn chat(&self, request: ChatRequest, deadline: Option<Duration>) -> Result<ChatReply> {
        let reply = self.chat_full(request, deadline).await?;
        Ok(ChatReply {
            session_id: reply.session_id,
            reply: reply.text,
        })
    }

    /// Run one blocking step and return the full step reply.
    ///
    /// Deadline handling matches [`Self::chat`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::StepTimeout` or `AppError::StepExecution`.
    pub async fn chat_full(
        &self,
        request: ChatRequest,
        deadline: Option<Duration>,
    ) -> Result<StepReply> {
        let session_id = self.session_id(&request.user_id, &request.conversation_id);
        self.bridge
            .run_blocking(&session_id, Turn::user(request.message), deadline)
            .await
    }

    /// Start one streaming step.
    #[must_use]
    pub fn chat_stream(&self, request: ChatRequest) -> EventStream {
        let session_id = self.session_id(&request.user_id, &request.conversation_id);
        self.bridge
            .run_streaming(&session_id, Turn::user(request.message))
    }

    /// Delete a session's checkpoint and lock entry.
    ///
    /// Waits for any in-flight step on the session first. Returns `true` if
    /// a checkpoint existed.
    pub async fn reset(&self, user_id: &str, conversation_id: &str) -> bool {
        let session_id = self.session_id(user_id, conversation_id);
        let guard = self.locks.acquire(&session_id).await;
        let existed = self.store.delete(&session_id);
        self.locks.release_and_forget(guard);
        info!(session_id, existed, "session reset");
        existed
    }

    /// Snapshot a session's state under its lock.
    ///
    /// A session with no checkpoint yields an empty snapshot.
    pub async fn inspect(&self, user_id: &str, conversation_id: &str) -> SessionSnapshot {
        let session_id = self.session_id(user_id, conversation_id);
        let guard = self.locks.acquire(&session_id).await;
        let checkpoint = self.store.get(&session_id).unwrap_or_default();
        drop(guard);
        SessionSnapshot {
            milestones: checkpoint
                .milestone_flags
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            message_count: checkpoint.turns.len(),
            action_count: checkpoint.action_count,
            tokens_in: checkpoint.tokens_in,
            tokens_out: checkpoint.tokens_out,
            summarized: checkpoint.is_summarized(),
            session_id,
        }
    }

    /// Start idle lock eviction if configured; `None` when disabled.
    #[must_use]
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let ttl = self.config.locks.idle_eviction_seconds;
        (ttl > 0).then(|| {
            spawn_eviction_task(Arc::clone(&self.locks), Duration::from_secs(ttl), cancel)
        })
    }
}
