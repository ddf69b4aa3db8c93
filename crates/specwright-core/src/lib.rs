//! specwright-core - Domain types and pure logic for the Specwright engine.
//!
//! Everything here is I/O-free (beyond reading config files) so the DAG
//! scheduler, review policy, and event model can be tested in isolation.

pub mod config;
pub mod dag;
pub mod events;
pub mod review;
pub mod types;

pub use config::{Config, ConfigError, ReviewParsePolicy};
pub use events::{SessionEvent, SessionPayload, WorkerEvent};
pub use review::{
    classify_error, detect_rate_limit, parse_verdict, retry_with_backoff, FixChunkSpec,
    RetryPolicy, ReviewErrorKind, ReviewVerdict,
};
pub use types::{
    Chunk, ChunkStatus, ChunkToolCall, Id, Project, QueueItem, ReviewStatus, Spec, SpecStatus,
    ToolCallStatus, Worker, WorkerProgress, WorkerStatus, WorkerStep,
};
