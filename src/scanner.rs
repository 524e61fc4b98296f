use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    transport::{AdvertisementHandler, BleTransport},
    types::{Advertisement, DeviceAddress, DiscoveredDevice, TimeoutConfig, WearableEvent},
    SERVICE_UUID,
};

struct ScanShared {
    devices: RwLock<HashMap<DeviceAddress, DiscoveredDevice>>,
    last_advertisement: Mutex<Instant>,
    scanning: AtomicBool,
    restarts: AtomicU64,
    events: mpsc::UnboundedSender<WearableEvent>,
}

impl ScanShared {
    fn touch(&self) {
        *self
            .last_advertisement
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn silence(&self) -> Duration {
        self.last_advertisement
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn on_advertisement(&self, advertisement: Advertisement) {
        if !advertisement.services.contains(&SERVICE_UUID) {
            return;
        }
        self.touch();

        let device = DiscoveredDevice {
            address: advertisement.address,
            name: advertisement.address.display_name(),
            rssi: advertisement.rssi,
            last_seen: SystemTime::now(),
        };
        let first_sighting = self
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.address, device.clone())
            .is_none();

        if first_sighting {
            info!("Found {} ({} dBm)", device.name, device.rssi);
            let _ = self.events.send(WearableEvent::DeviceDiscovered(device));
        }
    }

    fn handler(self: &Arc<Self>) -> AdvertisementHandler {
        let shared = Arc::downgrade(self);
        Arc::new(move |advertisement| {
            if let Some(shared) = shared.upgrade() {
                shared.on_advertisement(advertisement);
            }
        })
    }
}

/// Restarts an advertisement scan that has gone silent
///
/// Some adapters stop reporting advertisements after a while without any
/// error. Every `interval` the watchdog compares the time since the last
/// advertisement against `silence_threshold` and restarts the scan when it
/// is exceeded.
#[derive(Debug, Clone, Copy)]
pub struct ScanWatchdog {
    interval: Duration,
    silence_threshold: Duration,
}

impl ScanWatchdog {
    /// Create a watchdog with the given check period and threshold
    #[must_use]
    pub const fn new(interval: Duration, silence_threshold: Duration) -> Self {
        Self {
            interval,
            silence_threshold,
        }
    }

    fn spawn(
        self,
        transport: Arc<dyn BleTransport>,
        shared: Arc<ScanShared>,
        handler: AdvertisementHandler,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !shared.scanning.load(Ordering::SeqCst) {
                    break;
                }

                let silence = shared.silence();
                if silence <= self.silence_threshold {
                    continue;
                }

                warn!(
                    "No advertisements for {}ms, restarting scan",
                    silence.as_millis()
                );
                if let Err(e) = transport.stop_scan().await {
                    warn!("Failed to stop stalled scan: {}", e);
                }
                shared.touch();
                if let Err(e) = transport.start_scan(handler.clone()).await {
                    warn!("Failed to restart scan: {}", e);
                }
                shared.restarts.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Scan watchdog stopped");
        })
    }
}

/// Advertisement scanner for Tyme Wear sensors
pub struct Scanner {
    transport: Arc<dyn BleTransport>,
    shared: Arc<ScanShared>,
    watchdog: ScanWatchdog,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    /// Create a scanner reporting discoveries on `events`
    #[must_use]
    pub fn new(
        transport: Arc<dyn BleTransport>,
        timeouts: &TimeoutConfig,
        events: mpsc::UnboundedSender<WearableEvent>,
    ) -> Self {
        Self {
            transport,
            shared: Arc::new(ScanShared {
                devices: RwLock::new(HashMap::new()),
                last_advertisement: Mutex::new(Instant::now()),
                scanning: AtomicBool::new(false),
                restarts: AtomicU64::new(0),
                events,
            }),
            watchdog: ScanWatchdog::new(
                timeouts.scan_watchdog_interval(),
                timeouts.scan_silence_threshold(),
            ),
            watchdog_task: Mutex::new(None),
        }
    }

    /// Start scanning and arm the watchdog
    ///
    /// Devices found by a previous scan are forgotten.
    ///
    /// # Errors
    ///
    /// Returns any transport error from starting the scan.
    pub async fn start(&self) -> Result<()> {
        self.disarm_watchdog();
        self.shared
            .devices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared.touch();

        let handler = self.shared.handler();
        self.transport.start_scan(handler.clone()).await?;
        self.shared.scanning.store(true, Ordering::SeqCst);

        let task = self
            .watchdog
            .spawn(self.transport.clone(), self.shared.clone(), handler);
        *self
            .watchdog_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!("Scanning for Tyme Wear sensors...");
        Ok(())
    }

    /// Stop scanning and disarm the watchdog
    ///
    /// # Errors
    ///
    /// Returns any transport error from stopping the scan.
    pub async fn stop(&self) -> Result<()> {
        let was_scanning = self.is_scanning();
        self.disarm_watchdog();
        if was_scanning {
            info!(
                "Scan stopped with {} device(s) found",
                self.device_count()
            );
        }
        self.transport.stop_scan().await
    }

    fn disarm_watchdog(&self) {
        self.shared.scanning.store(false, Ordering::SeqCst);
        if let Some(task) = self
            .watchdog_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    /// Whether a scan is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    /// Devices seen by the current scan, strongest signal first
    #[must_use]
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> = self
            .shared
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi));
        devices
    }

    /// Look up a device seen by the current scan
    #[must_use]
    pub fn device(&self, address: DeviceAddress) -> Option<DiscoveredDevice> {
        self.shared
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    fn device_count(&self) -> usize {
        self.shared
            .devices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of times the watchdog restarted a stalled scan
    #[must_use]
    pub fn restart_count(&self) -> u64 {
        self.shared.restarts.load(Ordering::Relaxed)
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.disarm_watchdog();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockTransport};
    use tokio::sync::mpsc::error::TryRecvError;
    use uuid::Uuid;

    fn advertisement(address: u64, rssi: i16) -> Advertisement {
        Advertisement {
            address: DeviceAddress(address),
            local_name: None,
            rssi,
            services: vec![SERVICE_UUID],
        }
    }

    fn scanner(
        mock: &Arc<MockTransport>,
    ) -> (Scanner, mpsc::UnboundedReceiver<WearableEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Scanner::new(mock.clone(), &TimeoutConfig::default(), events),
            receiver,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_events_once_per_address() {
        let mock = Arc::new(MockTransport::tymewear());
        let (scanner, mut events) = scanner(&mock);
        scanner.start().await.unwrap();

        assert!(mock.advertise(advertisement(0xC0FF_EE00_1A2B, -70)));
        assert!(mock.advertise(advertisement(0xC0FF_EE00_1A2B, -55)));
        mock.advertise(advertisement(0x0000_0000_BEEF, -40));
        mock.advertise(Advertisement {
            services: vec![Uuid::nil()],
            ..advertisement(0x1234, -30)
        });

        let WearableEvent::DeviceDiscovered(first) = events.try_recv().unwrap() else {
            panic!("expected a discovery event");
        };
        assert_eq!(first.name, "TYME-1A2B");
        assert!(matches!(
            events.try_recv().unwrap(),
            WearableEvent::DeviceDiscovered(DiscoveredDevice { rssi: -40, .. })
        ));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

        let devices = scanner.devices();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].name, "TYME-BEEF");
        assert_eq!(devices[1].rssi, -55);
        assert!(scanner.device(DeviceAddress(0x1234)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_forgets_previous_devices() {
        let mock = Arc::new(MockTransport::tymewear());
        let (scanner, mut events) = scanner(&mock);
        scanner.start().await.unwrap();
        mock.advertise(advertisement(1, -60));
        scanner.stop().await.unwrap();
        assert_eq!(scanner.devices().len(), 1);

        scanner.start().await.unwrap();
        assert!(scanner.devices().is_empty());
        mock.advertise(advertisement(1, -60));

        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_restarts_silent_scan() {
        let mock = Arc::new(MockTransport::tymewear());
        let (scanner, _events) = scanner(&mock);
        scanner.start().await.unwrap();

        // Checks at 5s (quiet for 5s) and 10s (quiet for 10s).
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(scanner.restart_count(), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(scanner.restart_count(), 1);
        assert_eq!(mock.call_count(&MockCall::StopScan), 1);
        assert_eq!(mock.call_count(&MockCall::StartScan), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(scanner.restart_count(), 1);

        // A second silent period triggers a second restart.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(scanner.restart_count(), 2);
        assert!(mock.is_scanning());

        // The restarted scan still reports through the same shared state.
        assert!(mock.advertise(advertisement(7, -50)));
        assert_eq!(scanner.devices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_quiet_while_advertising() {
        let mock = Arc::new(MockTransport::tymewear());
        let (scanner, _events) = scanner(&mock);
        scanner.start().await.unwrap();

        for _ in 0..15 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            mock.advertise(advertisement(9, -65));
        }
        assert_eq!(scanner.restart_count(), 0);
        assert_eq!(mock.call_count(&MockCall::StartScan), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disarms_watchdog() {
        let mock = Arc::new(MockTransport::tymewear());
        let (scanner, _events) = scanner(&mock);
        scanner.start().await.unwrap();
        scanner.stop().await.unwrap();
        assert!(!scanner.is_scanning());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(scanner.restart_count(), 0);
        assert_eq!(mock.call_count(&MockCall::StartScan), 1);
        assert!(!mock.is_scanning());
    }
}
