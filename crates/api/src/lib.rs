//! Sluice async API: transport seam, search driver, panel loader.
//!
//! Frontends depend on this crate. The reconciliation itself is synchronous and lives in
//! `sluice-search`; everything here is about getting events to it in order and letting
//! readers observe the result.

#![forbid(unsafe_code)]

pub mod driver;
pub mod fields;
pub mod loader;
pub mod transport;

pub use driver::SearchDriver;
pub use fields::extract_fields;
pub use loader::{LoaderState, PanelLoader};
pub use transport::{CancelHandle, ReplayTransport, StreamHandle, Transport, TransportEvent};

pub use sluice_core::{EngineConfig, RequestDescriptor, SluiceError, SluiceResult};
pub use sluice_store::{SnapshotHandle, ViewSnapshot};
