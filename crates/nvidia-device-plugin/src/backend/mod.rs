//! Hardware collaborator seam.
//!
//! The plugin core only needs two things from the hardware library: the list of
//! devices present at startup, and a stream of fault events for those devices.

pub mod fake;

use error_stack::Report;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::BackendError;

pub use fake::FakeBackend;

/// A hardware fault reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultEvent {
    /// The device with this id failed.
    Device(String),
    /// The fault could not be attributed to a single device.
    AllDevices,
}

pub trait DeviceBackend: Send + Sync + 'static {
    /// Returns the ids of every device visible to the backend, in a stable order.
    fn enumerate_devices(&self) -> Result<Vec<String>, Report<BackendError>>;

    /// Starts watching for faults on `device_ids`.
    ///
    /// Events stop flowing and the returned receiver closes once
    /// `cancellation_token` is cancelled.
    fn watch_fault_events(
        &self,
        device_ids: &[String],
        cancellation_token: CancellationToken,
    ) -> Result<mpsc::Receiver<FaultEvent>, Report<BackendError>>;
}
