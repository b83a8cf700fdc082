#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Dispatch core for `imagehive` (worker pool management, request-to-worker
//! matching, generation pipeline, federation with peer instances).

/// Public API for the engine crate.
pub mod api;

pub mod claim;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod hooks;
pub mod record;

mod api_worker;
mod engine;
mod federation;
mod pipeline;

#[cfg(test)]
mod testing;

pub use api::{
    start_engine, EngineConfig, EngineEvent, EngineHandle, GenerateRequest, GenerationOutcome,
    OutputSink, ProgressUpdate, StatusSnapshot, StopHandle, WorkerView,
};
pub use api_worker::{ApiWorkerDriver, ApiWorkerSettings};
pub use claim::{Claim, ClaimKind, SessionLedger};
pub use dispatcher::{Dispatcher, WorkerAccess};
pub use driver::{GenerateItem, ImagePayload, StreamEnd, WorkerDriver};
pub use error::GenError;
pub use federation::{FederationDriver, FederationSettings};
pub use hooks::{HookRegistry, PostImageEvent, PreGenerateEvent, Refusal};
pub use record::{WorkerId, WorkerRecord, WorkerStatus};
