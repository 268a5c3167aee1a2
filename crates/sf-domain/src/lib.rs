//! Scribeflow domain core
//!
//! Pure domain logic for the clinical audio pipeline: run/stage/ingestion
//! records, the event envelope, artifact shapes, and the error taxonomy
//! every adapter maps into at its boundary. This crate MUST NOT import
//! HTTP frameworks, database clients, or model SDKs.

pub mod artifact;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod ingestion;
pub mod model_ports;
pub mod preview;
pub mod run;
pub mod stage;

pub use artifact::*;
pub use envelope::*;
pub use errors::*;
pub use ids::*;
pub use ingestion::*;
pub use model_ports::*;
pub use preview::*;
pub use run::*;
pub use stage::*;
