use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use error_stack::Report;
use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::EventSet;
use nvml_wrapper::Nvml;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::FaultEvent;
use crate::error::BackendError;

/// XIDs caused by user applications rather than by the GPU itself.
/// See https://docs.nvidia.com/deploy/xid-errors/index.html
pub const APPLICATION_XIDS: [u64; 3] = [31, 43, 45];

const EVENT_WAIT_TIMEOUT_MS: u32 = 5000;
const WAIT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

fn watch_error(e: NvmlError) -> Report<BackendError> {
    Report::new(BackendError::Watch {
        message: e.to_string(),
    })
}

/// Blocks until `cancellation_token` is cancelled or the receiver side of `tx`
/// is dropped, forwarding critical XID errors as fault events.
pub(super) fn watch_xids(
    nvml: &Nvml,
    device_ids: &[String],
    ignored_xids: &HashSet<u64>,
    tx: &mpsc::Sender<FaultEvent>,
    cancellation_token: &CancellationToken,
) -> Result<(), Report<BackendError>> {
    let mut event_set: EventSet<'_> = nvml.create_event_set().map_err(watch_error)?;

    for id in device_ids {
        let device = nvml.device_by_uuid(id.as_str()).map_err(watch_error)?;

        let supported = match device.supported_event_types() {
            Ok(types) => types.contains(EventTypes::CRITICAL_XID_ERROR),
            Err(NvmlError::NotSupported) => false,
            Err(e) => return Err(watch_error(e)),
        };
        if !supported {
            warn!(
                device = %id,
                "device is too old to support health checking, marking it unhealthy"
            );
            if tx.blocking_send(FaultEvent::Device(id.clone())).is_err() {
                return Ok(());
            }
            continue;
        }

        // a failed registration releases the set, so there is nothing to recover
        event_set = device
            .register_events(EventTypes::CRITICAL_XID_ERROR, event_set)
            .map_err(|e| watch_error(e.error))?;
    }

    info!("watching {} device(s) for critical XID errors", device_ids.len());

    while !cancellation_token.is_cancelled() {
        let event = match event_set.wait(EVENT_WAIT_TIMEOUT_MS) {
            Ok(event) => event,
            Err(NvmlError::Timeout) => continue,
            Err(e) => {
                debug!("NVML event wait failed: {e}");
                thread::sleep(WAIT_ERROR_BACKOFF);
                continue;
            }
        };

        let uuid = event.device.uuid().ok();
        let Some(fault) = classify(
            event.event_type,
            event.event_data.map(|xid| match xid {
                XidError::Value(value) => value,
                XidError::Unknown => 999,
            }),
            uuid.as_deref(),
            ignored_xids,
        ) else {
            continue;
        };

        if tx.blocking_send(fault).is_err() {
            break;
        }
    }

    debug!("XID watch stopped");
    Ok(())
}

/// Decides whether an NVML event is a device fault.
///
/// Only critical XID errors count, minus the ignored XIDs. An event whose
/// device has no UUID is blamed on every device.
pub(super) fn classify(
    event_type: EventTypes,
    xid: Option<u64>,
    uuid: Option<&str>,
    ignored_xids: &HashSet<u64>,
) -> Option<FaultEvent> {
    if !event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
        return None;
    }

    let xid = xid.unwrap_or_default();
    if ignored_xids.contains(&xid) {
        debug!(xid, "ignoring application XID error");
        return None;
    }

    let fault = match uuid {
        Some(uuid) if !uuid.is_empty() => FaultEvent::Device(uuid.to_string()),
        _ => FaultEvent::AllDevices,
    };
    warn!(xid, ?fault, "critical XID error");
    Some(fault)
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::platform::nvml::merge_ignored_xids;

    fn ignored(extra: &[u64]) -> HashSet<u64> {
        merge_ignored_xids(extra)
    }

    #[test]
    fn critical_xid_names_the_device() {
        assert_eq!(
            classify(
                EventTypes::CRITICAL_XID_ERROR,
                Some(79),
                Some("GPU-0"),
                &ignored(&[])
            ),
            Some(FaultEvent::Device("GPU-0".to_string()))
        );
    }

    #[test]
    fn application_xids_are_skipped() {
        for xid in [31, 43, 45] {
            assert_eq!(
                classify(
                    EventTypes::CRITICAL_XID_ERROR,
                    Some(xid),
                    Some("GPU-0"),
                    &ignored(&[])
                ),
                None
            );
        }
    }

    #[test]
    fn configured_xids_are_skipped_alongside_builtin_ones() {
        let ignored = ignored(&[13, 68]);

        for xid in [13, 68, 31] {
            assert_eq!(
                classify(
                    EventTypes::CRITICAL_XID_ERROR,
                    Some(xid),
                    Some("GPU-0"),
                    &ignored
                ),
                None
            );
        }
        assert_eq!(
            classify(
                EventTypes::CRITICAL_XID_ERROR,
                Some(48),
                Some("GPU-0"),
                &ignored
            ),
            Some(FaultEvent::Device("GPU-0".to_string()))
        );
    }

    #[test]
    fn event_without_uuid_blames_every_device() {
        for uuid in [None, Some("")] {
            assert_eq!(
                classify(
                    EventTypes::CRITICAL_XID_ERROR,
                    Some(79),
                    uuid,
                    &ignored(&[])
                ),
                Some(FaultEvent::AllDevices)
            );
        }
    }

    #[test]
    fn non_xid_events_are_dropped() {
        assert_eq!(
            classify(
                EventTypes::PSTATE_CHANGE,
                Some(79),
                Some("GPU-0"),
                &ignored(&[])
            ),
            None
        );
    }
}
