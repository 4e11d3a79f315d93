//! Health monitor: turns hardware fault events into device health transitions.

use std::sync::Arc;

use tokio::select;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::backend::DeviceBackend;
use crate::backend::FaultEvent;
use crate::device::Device;
use crate::device::DeviceSet;

pub struct HealthMonitor {
    devices: DeviceSet,
    backend: Arc<dyn DeviceBackend>,
    health_events: broadcast::Sender<Device>,
    enabled: bool,
}

impl HealthMonitor {
    pub fn new(
        devices: DeviceSet,
        backend: Arc<dyn DeviceBackend>,
        health_events: broadcast::Sender<Device>,
        enabled: bool,
    ) -> Self {
        Self {
            devices,
            backend,
            health_events,
            enabled,
        }
    }

    /// Runs until `cancellation_token` is cancelled.
    ///
    /// Failures of the fault source are logged and end health reporting, but the
    /// monitor keeps waiting for cancellation so shutdown stays uniform.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancellation_token: CancellationToken) {
        if !self.enabled {
            info!("Health checks disabled, all devices stay healthy");
            cancellation_token.cancelled().await;
            return;
        }

        let watch_token = cancellation_token.child_token();
        let mut faults = match self
            .backend
            .watch_fault_events(&self.devices.ids(), watch_token.clone())
        {
            Ok(faults) => faults,
            Err(e) => {
                error!("Failed to watch fault events, health reporting stopped: {e:?}");
                cancellation_token.cancelled().await;
                return;
            }
        };

        info!("Health monitor started for {} device(s)", self.devices.len());

        loop {
            select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!("Health monitor shutdown requested");
                    break;
                }
                fault = faults.recv() => match fault {
                    Some(fault) => self.handle_fault(&fault),
                    None => {
                        warn!("Fault event source closed, health reporting stopped");
                        cancellation_token.cancelled().await;
                        break;
                    }
                }
            }
        }

        watch_token.cancel();
    }

    fn handle_fault(&self, fault: &FaultEvent) {
        match fault {
            FaultEvent::Device(id) => match self.devices.find(id) {
                Some(device) => self.mark_unhealthy(device),
                None => debug!(device = %id, "ignoring fault for unknown device"),
            },
            FaultEvent::AllDevices => {
                for device in &self.devices {
                    self.mark_unhealthy(device);
                }
            }
        }
    }

    fn mark_unhealthy(&self, device: &Device) {
        if !device.mark_unhealthy() {
            return;
        }

        warn!(device = device.id(), "device marked unhealthy");
        // No receivers just means no ListAndWatch stream is open yet; the
        // next one starts from the updated snapshot.
        let _ = self.health_events.send(device.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::backend::FakeBackend;
    use crate::device::Health;

    fn monitor(
        ids: &[&str],
        enabled: bool,
    ) -> (
        HealthMonitor,
        Arc<FakeBackend>,
        DeviceSet,
        broadcast::Receiver<Device>,
    ) {
        let backend = Arc::new(FakeBackend::new(ids.iter().copied()));
        let devices = DeviceSet::new(ids.iter().copied());
        let (tx, rx) = broadcast::channel(16);
        let monitor = HealthMonitor::new(devices.clone(), backend.clone(), tx, enabled);
        (monitor, backend, devices, rx)
    }

    async fn wait_for_watcher(backend: &FakeBackend) {
        while backend.watchers() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test(tokio::test)]
    async fn fault_marks_device_unhealthy_once() {
        let (monitor, backend, devices, mut events) = monitor(&["GPU-0", "GPU-1"], true);
        let token = CancellationToken::new();
        let task = tokio::spawn(monitor.run(token.clone()));
        wait_for_watcher(&backend).await;

        backend.inject(FaultEvent::Device("GPU-0".to_string()));
        backend.inject(FaultEvent::Device("GPU-0".to_string()));
        backend.inject(FaultEvent::Device("GPU-1".to_string()));

        let first = events.recv().await.expect("first event");
        let second = events.recv().await.expect("second event");
        assert_eq!(first.id(), "GPU-0");
        assert_eq!(second.id(), "GPU-1");
        assert_eq!(
            devices.iter().map(Device::health).collect::<Vec<_>>(),
            vec![Health::Unhealthy, Health::Unhealthy]
        );

        token.cancel();
        task.await.expect("monitor task");
        assert!(events.try_recv().is_err());
    }

    #[test(tokio::test)]
    async fn unattributed_fault_marks_every_device() {
        let (monitor, backend, devices, mut events) = monitor(&["GPU-0", "GPU-1"], true);
        let token = CancellationToken::new();
        let task = tokio::spawn(monitor.run(token.clone()));
        wait_for_watcher(&backend).await;

        backend.inject(FaultEvent::AllDevices);

        assert_eq!(events.recv().await.expect("event").id(), "GPU-0");
        assert_eq!(events.recv().await.expect("event").id(), "GPU-1");
        assert!(devices.iter().all(|d| d.health() == Health::Unhealthy));

        token.cancel();
        task.await.expect("monitor task");
    }

    #[test(tokio::test)]
    async fn cancellation_stops_the_fault_watch() {
        let (monitor, backend, _devices, _events) = monitor(&["GPU-0"], true);
        let token = CancellationToken::new();
        let task = tokio::spawn(monitor.run(token.clone()));
        wait_for_watcher(&backend).await;

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("monitor should exit promptly")
            .expect("monitor task");

        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.watchers() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fault subscription should be released");
    }

    async fn assert_outlives_watch_failure(
        task: tokio::task::JoinHandle<()>,
        token: CancellationToken,
        devices: &DeviceSet,
    ) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished(), "monitor must wait for cancellation");
        assert!(devices.iter().all(|d| d.health() == Health::Healthy));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("monitor should exit promptly")
            .expect("monitor task");
    }

    #[test(tokio::test)]
    async fn failed_watch_keeps_monitor_alive_until_cancelled() {
        let (monitor, backend, devices, _events) = monitor(&["GPU-0", "GPU-1"], true);
        backend.fail_watches();
        let token = CancellationToken::new();
        let task = tokio::spawn(monitor.run(token.clone()));

        assert_outlives_watch_failure(task, token, &devices).await;
        assert_eq!(backend.watchers(), 0);
    }

    #[test(tokio::test)]
    async fn closed_fault_source_keeps_monitor_alive_until_cancelled() {
        let (monitor, backend, devices, mut events) = monitor(&["GPU-0", "GPU-1"], true);
        let token = CancellationToken::new();
        let task = tokio::spawn(monitor.run(token.clone()));
        wait_for_watcher(&backend).await;

        backend.close_sources();
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.watchers() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fault source should close");
        assert_eq!(backend.inject(FaultEvent::AllDevices), 0);

        assert_outlives_watch_failure(task, token, &devices).await;
        assert!(events.try_recv().is_err());
    }

    #[test(tokio::test)]
    async fn disabled_monitor_ignores_faults() {
        let (monitor, backend, devices, _events) = monitor(&["GPU-0"], false);
        let token = CancellationToken::new();
        let task = tokio::spawn(monitor.run(token.clone()));

        tokio::task::yield_now().await;
        assert_eq!(backend.watchers(), 0);
        assert_eq!(backend.inject(FaultEvent::AllDevices), 0);
        assert!(devices.iter().all(|d| d.health() == Health::Healthy));

        token.cancel();
        task.await.expect("monitor task");
    }
}
