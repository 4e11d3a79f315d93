//! NVIDIA Management Library (NVML) integration
//!
//! This module provides the production [`DeviceBackend`]:
//! - GPU device discovery
//! - Critical XID error watching for health reporting

mod xid_watcher;

use std::collections::HashSet;
use std::sync::Arc;

use error_stack::Report;
use nvml_wrapper::Nvml;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::backend::DeviceBackend;
use crate::backend::FaultEvent;
use crate::error::BackendError;

pub use xid_watcher::APPLICATION_XIDS;

const FAULT_CAPACITY: usize = 32;

/// GPU backend driven by NVML.
pub struct NvmlBackend {
    nvml: Arc<Nvml>,
    ignored_xids: Arc<HashSet<u64>>,
}

impl NvmlBackend {
    /// Loads NVML. `extra_ignored_xids` extends the built-in list of
    /// application-level XIDs that do not make a device unhealthy.
    pub fn init(extra_ignored_xids: &[u64]) -> Result<Self, Report<BackendError>> {
        let nvml = init_nvml()?;

        Ok(Self {
            nvml: Arc::new(nvml),
            ignored_xids: Arc::new(merge_ignored_xids(extra_ignored_xids)),
        })
    }
}

/// Built-in application XIDs plus the configured ones.
fn merge_ignored_xids(extra_ignored_xids: &[u64]) -> HashSet<u64> {
    APPLICATION_XIDS
        .iter()
        .chain(extra_ignored_xids)
        .copied()
        .collect()
}

fn init_nvml() -> Result<Nvml, Report<BackendError>> {
    match Nvml::init() {
        Ok(nvml) => {
            info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()
                .map_err(|e| {
                    Report::new(BackendError::Init {
                        message: e.to_string(),
                    })
                })?;
            info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}

impl DeviceBackend for NvmlBackend {
    fn enumerate_devices(&self) -> Result<Vec<String>, Report<BackendError>> {
        let enumerate_error = |e: nvml_wrapper::error::NvmlError| {
            Report::new(BackendError::Enumerate {
                message: e.to_string(),
            })
        };

        let device_count = self.nvml.device_count().map_err(enumerate_error)?;
        info!("Discovered {} GPU device(s)", device_count);

        let mut ids = Vec::with_capacity(device_count as usize);
        for i in 0..device_count {
            let device = self.nvml.device_by_index(i).map_err(enumerate_error)?;
            let uuid = device.uuid().map_err(enumerate_error)?;
            let name = device.name().unwrap_or_else(|_| "unknown".to_string());

            info!("Found GPU {}: {} ({})", i, uuid, name);
            ids.push(uuid);
        }

        Ok(ids)
    }

    fn watch_fault_events(
        &self,
        device_ids: &[String],
        cancellation_token: CancellationToken,
    ) -> Result<mpsc::Receiver<FaultEvent>, Report<BackendError>> {
        let (tx, rx) = mpsc::channel(FAULT_CAPACITY);
        let nvml = self.nvml.clone();
        let ignored_xids = self.ignored_xids.clone();
        let device_ids = device_ids.to_vec();

        // NVML event waits block the calling thread
        tokio::task::spawn_blocking(move || {
            if let Err(e) =
                xid_watcher::watch_xids(&nvml, &device_ids, &ignored_xids, &tx, &cancellation_token)
            {
                tracing::error!("XID watch terminated: {e:?}");
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn merged_ignore_list_keeps_builtin_xids() {
        let ignored = merge_ignored_xids(&[13, 68, 31]);

        assert_eq!(ignored, HashSet::from([31, 43, 45, 13, 68]));
        assert_eq!(merge_ignored_xids(&[]), HashSet::from(APPLICATION_XIDS));
    }
}
