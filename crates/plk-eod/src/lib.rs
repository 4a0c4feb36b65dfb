//! EOD snapshot pipeline.
//!
//! Per (account, business date): fetch the upstream snapshot, stage it into
//! a fresh batch, validate, and atomically promote it to ACTIVE under
//! blue/green semantics — or fail loudly without touching the previously
//! ACTIVE batch.

pub mod consumer;
pub mod hash;
pub mod pipeline;
pub mod upstream;
pub mod validate;

pub use consumer::run_eod_consumer;
pub use hash::canonical_content_hash;
pub use pipeline::{EodOutcome, EodPipeline};
pub use upstream::{HttpSnapshotSource, SnapshotSource};
pub use validate::{validate_snapshot, ValidationReport};
