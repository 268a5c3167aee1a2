//! In-process end-to-end harness for the full pipeline. Exercises the
//! real `sf-worker`/`sf-domain` stage machinery and harness-local
//! reimplementations of the orchestrator and ingestion gateway's
//! decision logic against in-memory fakes of the five `sf-ports`
//! traits, so the whole run → transcribe → redact → audit → soap flow
//! can be driven without a database, object store, or broker.

pub mod fakes;
pub mod ingestion_sim;
pub mod orchestrator_sim;
pub mod pipeline;
pub mod stubs;

pub use pipeline::{Pipeline, PipelineScript};
