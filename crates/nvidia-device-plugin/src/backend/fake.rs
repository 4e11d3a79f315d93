//! In-memory backend with a fixed device list and injectable faults.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use error_stack::Report;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::DeviceBackend;
use super::FaultEvent;
use crate::error::BackendError;

const FAULT_CAPACITY: usize = 64;

/// Backend that reports a fixed set of device ids and forwards faults injected
/// through [`FakeBackend::inject`].
#[derive(Debug)]
pub struct FakeBackend {
    device_ids: Vec<String>,
    faults: broadcast::Sender<FaultEvent>,
    /// new watches fail to start while set
    fail_watches: AtomicBool,
    /// cancelled by [`FakeBackend::close_sources`]
    sources_closed: CancellationToken,
}

impl FakeBackend {
    pub fn new<I, S>(device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (faults, _) = broadcast::channel(FAULT_CAPACITY);
        Self {
            device_ids: device_ids.into_iter().map(Into::into).collect(),
            faults,
            fail_watches: AtomicBool::new(false),
            sources_closed: CancellationToken::new(),
        }
    }

    /// Makes every later [`DeviceBackend::watch_fault_events`] call fail.
    pub fn fail_watches(&self) {
        self.fail_watches.store(true, Ordering::Release);
    }

    /// Closes the receiver of every active watch, as if the hardware event
    /// source died. Watches started afterwards close immediately.
    pub fn close_sources(&self) {
        self.sources_closed.cancel();
    }

    /// Delivers a fault to every active watch. Returns the number of watches
    /// that received it.
    pub fn inject(&self, fault: FaultEvent) -> usize {
        self.faults.send(fault).unwrap_or(0)
    }

    /// Number of watches currently subscribed.
    pub fn watchers(&self) -> usize {
        self.faults.receiver_count()
    }
}

impl DeviceBackend for FakeBackend {
    fn enumerate_devices(&self) -> Result<Vec<String>, Report<BackendError>> {
        Ok(self.device_ids.clone())
    }

    fn watch_fault_events(
        &self,
        device_ids: &[String],
        cancellation_token: CancellationToken,
    ) -> Result<mpsc::Receiver<FaultEvent>, Report<BackendError>> {
        if self.fail_watches.load(Ordering::Acquire) {
            return Err(Report::new(BackendError::Watch {
                message: "fault watch unavailable".to_string(),
            }));
        }

        let sources_closed = self.sources_closed.clone();
        let watched: HashSet<String> = device_ids.iter().cloned().collect();
        let mut injected = self.faults.subscribe();
        let (tx, rx) = mpsc::channel(FAULT_CAPACITY);

        tokio::spawn(async move {
            loop {
                let fault = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = sources_closed.cancelled() => break,
                    fault = injected.recv() => match fault {
                        Ok(fault) => fault,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if let FaultEvent::Device(id) = &fault {
                    if !watched.contains(id) {
                        debug!(device = %id, "ignoring fault for unwatched device");
                        continue;
                    }
                }

                if tx.send(fault).await.is_err() {
                    break;
                }
            }
            debug!("fake fault watch stopped");
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test(tokio::test)]
    async fn forwards_faults_for_watched_devices_only() {
        let backend = FakeBackend::new(["GPU-0", "GPU-1"]);
        let token = CancellationToken::new();
        let mut faults = backend
            .watch_fault_events(&["GPU-0".to_string()], token.clone())
            .expect("watch should start");

        assert_eq!(backend.watchers(), 1);
        backend.inject(FaultEvent::Device("GPU-1".to_string()));
        backend.inject(FaultEvent::Device("GPU-0".to_string()));
        backend.inject(FaultEvent::AllDevices);

        assert_eq!(
            faults.recv().await,
            Some(FaultEvent::Device("GPU-0".to_string()))
        );
        assert_eq!(faults.recv().await, Some(FaultEvent::AllDevices));

        token.cancel();
        assert_eq!(faults.recv().await, None);
    }

    #[test(tokio::test)]
    async fn failing_mode_rejects_new_watches() {
        let backend = FakeBackend::new(["GPU-0"]);
        backend.fail_watches();

        let err = backend
            .watch_fault_events(&["GPU-0".to_string()], CancellationToken::new())
            .expect_err("watch should fail");
        assert!(matches!(err.current_context(), BackendError::Watch { .. }));
        assert_eq!(backend.watchers(), 0);
    }

    #[test(tokio::test)]
    async fn close_sources_ends_active_watches() {
        let backend = FakeBackend::new(["GPU-0"]);
        let token = CancellationToken::new();
        let mut faults = backend
            .watch_fault_events(&["GPU-0".to_string()], token.clone())
            .expect("watch should start");

        backend.close_sources();

        assert_eq!(faults.recv().await, None);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn enumerates_configured_devices() {
        let backend = FakeBackend::new(["GPU-0", "GPU-1"]);

        assert_eq!(
            backend.enumerate_devices().expect("enumerate"),
            vec!["GPU-0".to_string(), "GPU-1".to_string()]
        );
    }
}
