// Spindle worker: ingestion and execution
//
// This crate owns everything between an inbound pipeline record and its
// terminal status event:
// - the event consumer (one websocket task per knot, cursor-based resume)
// - the jetstream ingester (membership records off the firehose)
// - the bounded job queue
// - the docker engine (container-per-step with guaranteed cleanup)
// - the per-workflow NDJSON logger
// - the orchestrator that wires them together

pub mod consumer;
pub mod engine;
pub mod jetstream;
pub mod logger;
pub mod queue;
pub mod spindle;

pub use consumer::{ConsumerConfig, EventConsumer, EventSource, ProcessFunc, SourceMessage};
pub use engine::{DockerEngine, DockerEngineConfig};
pub use jetstream::JetstreamIngester;
pub use logger::WorkflowLogger;
pub use queue::{Job, JobQueue};
pub use spindle::{Spindle, SpindleConfig};
