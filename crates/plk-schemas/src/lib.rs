//! Shared types for the PositionKeep loader.
//!
//! Everything that crosses a crate boundary lives here: reference-data and
//! snapshot DTOs, stream event payloads, the batch/run status machines, and
//! the loader error taxonomy. This crate has no I/O.

pub mod error;
pub mod events;
pub mod model;
pub mod status;

pub use error::{ErrorKind, LoaderError};
pub use events::{
    ClientSignoffEvent, EodTrigger, IntradayEvent, PositionChangeEvent, Side, Topic,
};
pub use model::{
    AccountRef, AccountSnapshot, ClientRef, FundRef, ProductRef, SnapshotPosition,
};
pub use status::{BatchStatus, DlqStatus, RunStatus};
