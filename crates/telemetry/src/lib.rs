//! # Storyloom Telemetry
//!
//! Execution records for pipeline runs and their stages, the `RunSink`
//! collaborator trait the orchestrator reports through, an in-memory sink
//! implementation, and the tracing bootstrap.
//!
//! Sink calls are fire-and-forget from the orchestrator's perspective: a
//! failing sink must never abort a pipeline run.

pub mod logging;
pub mod model;
pub mod sink;

pub use logging::init_tracing;
pub use model::{RunRecord, RunStatus, StageKind, StageRecord, StageStatus};
pub use sink::{MemorySink, RunSink};
