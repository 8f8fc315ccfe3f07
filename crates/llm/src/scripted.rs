use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream;

use super::model::Model;
use super::service::{
    BoxFuture, Chunk, ChunkStream, ContinuationState, GenerateRequest, GenerationError,
    GenerationResult, GenerationService, ModelRejectedSnafu, ServiceUnavailableSnafu,
    StreamChunkSnafu,
};

pub const SCRIPTED_SERVICE_ID: &str = "scripted";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScriptStep {
    Chunk(Chunk),
    Delay(Duration),
    Stall,
    Fail(String),
}

/// Deterministic response for one `generate` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    steps: Vec<ScriptStep>,
    rejection: Option<String>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script whose `generate` call fails before any stream is opened.
    pub fn reject(details: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            rejection: Some(details.into()),
        }
    }

    pub fn chunk(mut self, text: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Chunk(Chunk::text(text)));
        self
    }

    pub fn chunk_with_state(
        mut self,
        text: impl Into<String>,
        continuation: impl Into<ContinuationState>,
    ) -> Self {
        self.steps
            .push(ScriptStep::Chunk(Chunk::text(text).with_continuation(continuation)));
        self
    }

    /// Terminal empty chunk carrying the final snapshot, the way the service closes a turn.
    pub fn finish_with(self, continuation: impl Into<ContinuationState>) -> Self {
        self.chunk_with_state("", continuation)
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(ScriptStep::Delay(duration));
        self
    }

    /// Never yields again; only cancellation or an idle timeout ends the stream.
    pub fn stall(mut self) -> Self {
        self.steps.push(ScriptStep::Stall);
        self
    }

    pub fn fail(mut self, details: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Fail(details.into()));
        self
    }

    fn into_stream(self) -> ChunkStream {
        let steps = self.steps.into_iter().collect::<VecDeque<_>>();
        Box::pin(stream::unfold(steps, |mut steps| async move {
            loop {
                match steps.pop_front()? {
                    ScriptStep::Chunk(chunk) => return Some((Ok(chunk), steps)),
                    ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Stall => futures::future::pending::<()>().await,
                    ScriptStep::Fail(details) => {
                        steps.clear();
                        let error: GenerationError = StreamChunkSnafu {
                            stage: "scripted-stream-chunk",
                            details,
                        }
                        .build();
                        return Some((Err(error), steps));
                    }
                }
            }
        }))
    }
}

/// In-process generation service that replays queued scripts in FIFO order and records
/// every request it receives.
pub struct ScriptedService {
    models: Vec<Model>,
    list_failure: Option<String>,
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedService {
    pub fn new(models: Vec<Model>) -> Self {
        Self {
            models,
            list_failure: None,
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model_ids<I, S>(model_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(model_ids.into_iter().map(Model::from_id).collect())
    }

    pub fn with_list_failure(mut self, details: impl Into<String>) -> Self {
        self.list_failure = Some(details.into());
        self
    }

    pub fn with_script(self, script: Script) -> Self {
        self.push_script(script);
        self
    }

    pub fn push_script(&self, script: Script) {
        lock(&self.scripts).push_back(script);
    }

    pub fn pending_scripts(&self) -> usize {
        lock(&self.scripts).len()
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<GenerateRequest> {
        lock(&self.requests).last().cloned()
    }
}

impl GenerationService for ScriptedService {
    fn id(&self) -> &str {
        SCRIPTED_SERVICE_ID
    }

    fn list_models<'a>(&'a self) -> BoxFuture<'a, GenerationResult<Vec<Model>>> {
        Box::pin(async move {
            if let Some(details) = &self.list_failure {
                return ServiceUnavailableSnafu {
                    stage: "scripted-list-models",
                    details: details.clone(),
                }
                .fail();
            }
            Ok(self.models.clone())
        })
    }

    fn generate<'a>(
        &'a self,
        request: GenerateRequest,
    ) -> BoxFuture<'a, GenerationResult<ChunkStream>> {
        Box::pin(async move {
            let model_known = self.models.iter().any(|model| model.id == request.model_id);
            let model_id = request.model_id.clone();
            lock(&self.requests).push(request);

            if !model_known {
                return ModelRejectedSnafu {
                    stage: "scripted-generate-model",
                    model_id,
                }
                .fail();
            }

            let Some(script) = lock(&self.scripts).pop_front() else {
                tracing::warn!(model_id = %model_id, "scripted service has no queued script");
                return ServiceUnavailableSnafu {
                    stage: "scripted-generate-dequeue",
                    details: "no scripted response queued".to_string(),
                }
                .fail();
            };

            if let Some(details) = script.rejection {
                return ServiceUnavailableSnafu {
                    stage: "scripted-generate-reject",
                    details,
                }
                .fail();
            }

            Ok(script.into_stream())
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn replays_scripts_in_order_and_records_requests() {
        let service = ScriptedService::with_model_ids(["m1"])
            .with_script(Script::new().chunk("Hi").chunk(" there").finish_with([1, 2, 3]));

        let request = GenerateRequest::new("m1", "hello", ContinuationState::empty());
        let stream = service.generate(request.clone()).await.expect("stream opens");
        let chunks = stream.collect::<Vec<_>>().await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].as_ref().map(|chunk| chunk.text.as_str()).ok(), Some("Hi"));
        assert_eq!(
            chunks[2].as_ref().ok().and_then(|chunk| chunk.continuation.clone()),
            Some(ContinuationState::from([1, 2, 3]))
        );
        assert_eq!(service.requests(), vec![request]);
        assert_eq!(service.pending_scripts(), 0);
    }

    #[tokio::test]
    async fn failing_step_ends_the_stream() {
        let service = ScriptedService::with_model_ids(["m1"])
            .with_script(Script::new().chunk("par").fail("boom").chunk("never"));

        let stream = service
            .generate(GenerateRequest::new("m1", "x", ContinuationState::empty()))
            .await
            .expect("stream opens");
        let chunks = stream.collect::<Vec<_>>().await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(GenerationError::StreamChunk { .. })));
    }

    #[tokio::test]
    async fn unknown_model_and_empty_queue_are_rejected() {
        let service = ScriptedService::with_model_ids(["m1"]);

        let unknown = service
            .generate(GenerateRequest::new("m2", "x", ContinuationState::empty()))
            .await;
        assert!(matches!(unknown, Err(GenerationError::ModelRejected { .. })));

        let empty = service
            .generate(GenerateRequest::new("m1", "x", ContinuationState::empty()))
            .await;
        assert!(matches!(empty, Err(GenerationError::ServiceUnavailable { .. })));
        assert_eq!(service.requests().len(), 2);
    }

    #[tokio::test]
    async fn list_failure_is_reported() {
        let service = ScriptedService::with_model_ids(["m1"]).with_list_failure("offline");
        assert!(service.list_models().await.is_err());
    }
}
