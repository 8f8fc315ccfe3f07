use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use snafu::Snafu;

use super::model::Model;

/// Opaque conversation memory returned by the generation service.
///
/// The engine never inspects the tokens; it only threads the latest snapshot back into
/// the next request for the same session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ContinuationState(Vec<i64>);

impl ContinuationState {
    pub fn new(tokens: Vec<i64>) -> Self {
        Self(tokens)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn tokens(&self) -> &[i64] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<i64>> for ContinuationState {
    fn from(tokens: Vec<i64>) -> Self {
        Self::new(tokens)
    }
}

impl<const N: usize> From<[i64; N]> for ContinuationState {
    fn from(tokens: [i64; N]) -> Self {
        Self::new(tokens.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub model_id: String,
    pub prompt: String,
    pub continuation: ContinuationState,
    /// Transport-encoded image payloads, in attachment order.
    pub images: Vec<String>,
}

impl GenerateRequest {
    pub fn new(
        model_id: impl Into<String>,
        prompt: impl Into<String>,
        continuation: ContinuationState,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            continuation,
            images: Vec::new(),
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

/// One increment of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub continuation: Option<ContinuationState>,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            continuation: None,
        }
    }

    pub fn with_continuation(mut self, continuation: impl Into<ContinuationState>) -> Self {
        self.continuation = Some(continuation.into());
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = GenerationResult<Chunk>> + Send + 'static>>;
pub type GenerationResult<T> = Result<T, GenerationError>;

#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum GenerationError {
    #[snafu(display("generation service is unavailable on `{stage}`: {details}"))]
    ServiceUnavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("model '{model_id}' was rejected by the generation service"))]
    ModelRejected {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("generation stream failed on `{stage}`: {details}"))]
    StreamChunk {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("no chunk arrived within {timeout_ms}ms"))]
    IdleTimeout { stage: &'static str, timeout_ms: u64 },
    #[snafu(display("generation worker stopped unexpectedly: {details}"))]
    WorkerAborted {
        stage: &'static str,
        details: String,
    },
}

/// Contract of the external text-generation service.
///
/// `generate` resolves once the service accepted the request; the returned stream is
/// lazy and finite, and the consumer may drop it at any point to abandon the request.
pub trait GenerationService: Send + Sync {
    fn id(&self) -> &str;
    fn list_models<'a>(&'a self) -> BoxFuture<'a, GenerationResult<Vec<Model>>>;
    fn generate<'a>(
        &'a self,
        request: GenerateRequest,
    ) -> BoxFuture<'a, GenerationResult<ChunkStream>>;
}
