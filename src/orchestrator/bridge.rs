//! Execution bridge between callers and the step pipeline.
//!
//! A step runs either on a spawned task or, when spawning is disallowed,
//! inline in the caller's task. Streaming output flows through a bounded
//! channel; a producer that cannot push within the send timeout cancels
//! the step instead of blocking forever.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::models::event::{StepFragment, StreamEvent};
use crate::models::turn::Turn;
use crate::orchestrator::pipeline::{StepPipeline, StepReply};
use crate::{AppError, Result};

/// Producer side of the fragment channel handed to a running step.
#[derive(Debug, Clone)]
pub struct FragmentSink {
    tx: Option<mpsc::Sender<StepFragment>>,
    send_timeout: Duration,
    cancel: CancellationToken,
}

impl FragmentSink {
    /// A sink that drops every fragment (blocking mode).
    #[must_use]
    pub fn discard() -> Self {
        Self {
            tx: None,
            send_timeout: Duration::ZERO,
            cancel: CancellationToken::new(),
        }
    }

    /// A bounded channel of `capacity` fragments and its sink.
    #[must_use]
    pub fn channel(
        capacity: usize,
        send_timeout: Duration,
    ) -> (Self, mpsc::Receiver<StepFragment>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = Self {
            tx: Some(tx),
            send_timeout,
            cancel: CancellationToken::new(),
        };
        (sink, rx)
    }

    /// Push one fragment, waiting at most the send timeout for room.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` if the sink was cancelled, the consumer
    /// dropped the receiver, or the channel stayed full past the timeout.
    /// The sink is cancelled in every such case.
    pub async fn emit(&self, fragment: StepFragment) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled("stream already cancelled".into()));
        }
        match tokio::time::timeout(self.send_timeout, tx.send(fragment)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.cancel.cancel();
                Err(AppError::Cancelled("stream consumer disconnected".into()))
            }
            Err(_) => {
                self.cancel.cancel();
                warn!(
                    timeout_ms = self.send_timeout.as_millis(),
                    "stream consumer stopped reading; cancelling step"
                );
                Err(AppError::Cancelled(format!(
                    "stream consumer did not read for {}ms",
                    self.send_timeout.as_millis()
                )))
            }
        }
    }

    /// Whether the stream was abandoned.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when the stream is abandoned.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

type StepJob = Pin<Box<dyn Future<Output = Result<StepReply>> + Send>>;

enum Driver {
    Spawned(JoinHandle<Result<StepReply>>),
    Inline(StepJob),
    Ready(Result<StepReply>),
    Done,
}

/// Consumer side of a streaming step.
///
/// Yields fragments translated to [`StreamEvent`]s in order, then exactly one
/// terminal `final` or `error` event.
pub struct EventStream {
    session_id: String,
    rx: mpsc::Receiver<StepFragment>,
    driver: Driver,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let driver = match self.driver {
            Driver::Spawned(_) => "spawned",
            Driver::Inline(_) => "inline",
            Driver::Ready(_) => "ready",
            Driver::Done => "done",
        };
        f.debug_struct("EventStream")
            .field("session_id", &self.session_id)
            .field("driver", &driver)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Session this stream belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, or `None` after the terminal event.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        // Inline steps only make progress while polled here.
        let finished = if let Driver::Inline(job) = &mut self.driver {
            tokio::select! {
                biased;
                Some(fragment) = self.rx.recv() => {
                    return Some(StreamEvent::from_fragment(fragment));
                }
                result = job.as_mut() => Some(result),
            }
        } else {
            None
        };
        if let Some(result) = finished {
            self.driver = Driver::Ready(result);
        }

        if matches!(self.driver, Driver::Done) {
            return None;
        }
        if let Some(fragment) = self.rx.recv().await {
            return Some(StreamEvent::from_fragment(fragment));
        }

        let outcome = match std::mem::replace(&mut self.driver, Driver::Done) {
            Driver::Ready(result) => result,
            Driver::Spawned(handle) => handle
                .await
                .unwrap_or_else(|err| Err(AppError::step("StepAborted", err.to_string()))),
            Driver::Inline(job) => job.await,
            Driver::Done => return None,
        };
        Some(match outcome {
            Ok(reply) => StreamEvent::Final { text: reply.text },
            Err(err) => StreamEvent::error(&err, &self.session_id),
        })
    }

    /// Drain every remaining event.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Adapt into a `futures` stream.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures_util::stream::unfold(self, |mut events| async move {
            events.next().await.map(|event| (event, events))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        // Abandoning the stream before its terminal event abandons the step.
        if !matches!(self.driver, Driver::Done) {
            self.cancel.cancel();
        }
    }
}

/// Runs steps in blocking or streaming mode.
#[derive(Debug, Clone)]
pub struct ExecutionBridge {
    pipeline: Arc<StepPipeline>,
    config: BridgeConfig,
}

impl ExecutionBridge {
    /// Create a bridge over `pipeline`.
    #[must_use]
    pub fn new(pipeline: Arc<StepPipeline>, config: BridgeConfig) -> Self {
        Self { pipeline, config }
    }

    /// Underlying pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<StepPipeline> {
        &self.pipeline
    }

    /// Run one step and wait for its reply.
    ///
    /// `deadline` defaults to the configured step timeout. When it elapses
    /// the caller gets [`AppError::StepTimeout`] while the step keeps running
    /// and commits on its own. Inline execution cannot be preempted, so in
    /// that mode the step always runs to completion.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StepTimeout` on deadline expiry and
    /// `AppError::StepExecution` if the step failed.
    pub async fn run_blocking(
        &self,
        session_id: &str,
        turn: Turn,
        deadline: Option<Duration>,
    ) -> Result<StepReply> {
        let deadline = deadline.unwrap_or_else(|| self.config.step_timeout());

        if !self.config.allow_spawn {
            let started = Instant::now();
            let result = self
                .pipeline
                .run(session_id, turn, &FragmentSink::discard())
                .await;
            if started.elapsed() > deadline {
                warn!(
                    session_id,
                    deadline_secs = deadline.as_secs(),
                    "inline step exceeded its deadline"
                );
            }
            return result;
        }

        let pipeline = Arc::clone(&self.pipeline);
        let owned_id = session_id.to_owned();
        let handle = tokio::spawn(async move {
            pipeline
                .run(&owned_id, turn, &FragmentSink::discard())
                .await
        });

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(AppError::step("StepAborted", err.to_string())),
            Err(_) => {
                warn!(
                    session_id,
                    deadline_secs = deadline.as_secs(),
                    "step deadline elapsed; step continues in background"
                );
                Err(AppError::StepTimeout {
                    session_id: session_id.to_owned(),
                    seconds: deadline.as_secs(),
                })
            }
        }
    }

    /// Start one step and return its event stream.
    #[must_use]
    pub fn run_streaming(&self, session_id: &str, turn: Turn) -> EventStream {
        let (sink, rx) = FragmentSink::channel(
            self.config.channel_capacity,
            self.config.send_timeout(),
        );
        let cancel = sink.cancellation();
        let pipeline = Arc::clone(&self.pipeline);
        let owned_id = session_id.to_owned();
        let job: StepJob = Box::pin(async move {
            let result = pipeline.run(&owned_id, turn, &sink).await;
            drop(sink);
            result
        });

        let driver = if self.config.allow_spawn {
            debug!(session_id, "streaming step on spawned task");
            Driver::Spawned(tokio::spawn(job))
        } else {
            debug!(session_id, "streaming step inline");
            Driver::Inline(job)
        };

        EventStream {
            session_id: session_id.to_owned(),
            rx,
            driver,
            cancel,
        }
    }
}
