#![deny(unsafe_code)]

//! Contract of the text-generation service consumed by the conversation engine.

mod model;
pub mod scripted;
mod service;

pub use model::{Model, ModelCatalog, ModelCatalogSource};
pub use scripted::{Script, ScriptedService};
pub use service::{
    BoxFuture, Chunk, ChunkStream, ContinuationState, GenerateRequest, GenerationError,
    GenerationResult, GenerationService, IdleTimeoutSnafu, WorkerAbortedSnafu,
};
