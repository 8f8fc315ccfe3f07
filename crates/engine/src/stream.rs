use std::sync::Arc;
use std::time::Duration;

use anywhere_llm::{
    Chunk, ChunkStream, ContinuationState, GenerateRequest, GenerationError, GenerationResult,
    GenerationService, IdleTimeoutSnafu,
};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransition {
    Start,
    Complete,
    Cancel,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStarted { phase: StreamPhase },
    NotStreaming { phase: StreamPhase },
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Applies one transition. Only `Idle` may start and only `Streaming` may settle;
    /// terminal phases accept nothing.
    pub fn apply(
        self,
        transition: StreamTransition,
    ) -> Result<StreamPhase, StreamTransitionRejection> {
        match (self, transition) {
            (Self::Idle, StreamTransition::Start) => Ok(Self::Streaming),
            (phase, StreamTransition::Start) => {
                Err(StreamTransitionRejection::AlreadyStarted { phase })
            }
            (Self::Streaming, StreamTransition::Complete) => Ok(Self::Completed),
            (Self::Streaming, StreamTransition::Cancel) => Ok(Self::Cancelled),
            (Self::Streaming, StreamTransition::Fail) => Ok(Self::Failed),
            (phase, _) => Err(StreamTransitionRejection::NotStreaming { phase }),
        }
    }
}

/// Terminal report of one controller run.
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Completed {
        text: String,
        continuation: ContinuationState,
    },
    Cancelled {
        text: String,
    },
    /// `text` is whatever accumulated before the failure.
    Failed {
        text: String,
        error: GenerationError,
    },
}

impl StreamOutcome {
    pub fn text(&self) -> &str {
        match self {
            Self::Completed { text, .. } | Self::Cancelled { text } | Self::Failed { text, .. } => {
                text
            }
        }
    }

    pub fn phase(&self) -> StreamPhase {
        match self {
            Self::Completed { .. } => StreamPhase::Completed,
            Self::Cancelled { .. } => StreamPhase::Cancelled,
            Self::Failed { .. } => StreamPhase::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamOptions {
    pub idle_timeout: Option<Duration>,
}

/// Caller-side view of a running controller: cancellation and live progress.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    cancel: CancellationToken,
    progress: watch::Receiver<String>,
}

impl StreamHandle {
    /// Requests a cooperative stop; accumulated text is kept.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress_text(&self) -> String {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.progress.clone()
    }
}

/// Consumes exactly one generation stream.
///
/// A controller is created idle, run once, and consumed by the run; a new request needs
/// a new controller.
pub struct StreamController {
    phase: StreamPhase,
    accumulated: String,
    continuation: Option<ContinuationState>,
    chunk_count: usize,
    cancel: CancellationToken,
    progress: watch::Sender<String>,
    options: StreamOptions,
}

impl StreamController {
    pub fn new(options: StreamOptions) -> (Self, StreamHandle) {
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(String::new());
        let handle = StreamHandle {
            cancel: cancel.clone(),
            progress: progress_rx,
        };

        let controller = Self {
            phase: StreamPhase::Idle,
            accumulated: String::new(),
            continuation: None,
            chunk_count: 0,
            cancel,
            progress: progress_tx,
            options,
        };
        (controller, handle)
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// Spawns the consumption loop and returns without waiting for any chunk.
    pub fn start(
        self,
        service: Arc<dyn GenerationService>,
        request: GenerateRequest,
    ) -> JoinHandle<StreamOutcome> {
        tokio::spawn(async move { self.run(service.as_ref(), request).await })
    }

    pub async fn run(
        mut self,
        service: &dyn GenerationService,
        request: GenerateRequest,
    ) -> StreamOutcome {
        self.transition(StreamTransition::Start);
        let cancel = self.cancel.clone();
        let model_id = request.model_id.clone();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.finish_cancelled(),
            opened = service.generate(request) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!(
                    service_id = %service.id(),
                    model_id = %model_id,
                    error = %error,
                    "failed to open generation stream"
                );
                return self.finish_failed(error);
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.finish_cancelled(),
                next = next_chunk(&mut stream, self.options.idle_timeout) => next,
            };

            match next {
                Ok(Some(chunk)) => self.apply_chunk(chunk),
                Ok(None) => return self.finish_completed(),
                Err(error) => {
                    tracing::warn!(
                        model_id = %model_id,
                        chunk_count = self.chunk_count,
                        error = %error,
                        "generation stream failed"
                    );
                    return self.finish_failed(error);
                }
            }
        }
    }

    fn apply_chunk(&mut self, chunk: Chunk) {
        self.chunk_count += 1;
        if let Some(continuation) = chunk.continuation {
            self.continuation = Some(continuation);
        }
        if chunk.text.is_empty() {
            return;
        }

        self.accumulated.push_str(&chunk.text);
        self.progress.send_modify(|progress| progress.push_str(&chunk.text));
    }

    fn finish_completed(mut self) -> StreamOutcome {
        self.transition(StreamTransition::Complete);
        tracing::debug!(
            chunk_count = self.chunk_count,
            text_len = self.accumulated.len(),
            has_continuation = self.continuation.is_some(),
            "generation stream completed"
        );
        StreamOutcome::Completed {
            text: self.accumulated,
            continuation: self.continuation.unwrap_or_default(),
        }
    }

    fn finish_cancelled(mut self) -> StreamOutcome {
        self.transition(StreamTransition::Cancel);
        tracing::debug!(
            chunk_count = self.chunk_count,
            text_len = self.accumulated.len(),
            "generation stream cancelled"
        );
        StreamOutcome::Cancelled {
            text: self.accumulated,
        }
    }

    fn finish_failed(mut self, error: GenerationError) -> StreamOutcome {
        self.transition(StreamTransition::Fail);
        StreamOutcome::Failed {
            text: self.accumulated,
            error,
        }
    }

    fn transition(&mut self, transition: StreamTransition) {
        match self.phase.apply(transition) {
            Ok(next) => self.phase = next,
            Err(rejection) => {
                tracing::error!(?rejection, ?transition, "rejected stream transition");
            }
        }
    }
}

async fn next_chunk(
    stream: &mut ChunkStream,
    idle_timeout: Option<Duration>,
) -> GenerationResult<Option<Chunk>> {
    let Some(limit) = idle_timeout else {
        return stream.next().await.transpose();
    };

    match tokio::time::timeout(limit, stream.next()).await {
        Ok(item) => item.transpose(),
        Err(_) => IdleTimeoutSnafu {
            stage: "stream-next-chunk",
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }
        .fail(),
    }
}
