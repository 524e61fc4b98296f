use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::SystemTime,
};
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, info, trace, warn};

use crate::{
    battery::BatteryTracker,
    command::{CommandChannel, ControlNotification},
    diagnostics::{DiagnosticsSnapshot, SessionDiagnostics},
    download::DownloadReassembler,
    error::DecodeError,
    telemetry,
    transport::{BleTransport, NotificationHandler},
    types::{DeviceAddress, TimeoutConfig, WearableEvent},
    BATTERY_LEVEL_CHAR_UUID,
};

/// State of one connection to a sensor
///
/// Owns the command channel, the download reassembler and the diagnostics
/// of the connection. A session is created once the device handle is
/// resolved and dropped on teardown; it is never reused.
pub struct DeviceSession {
    id: u64,
    address: DeviceAddress,
    commands: CommandChannel,
    downloads: Arc<DownloadReassembler>,
    battery: BatteryTracker,
    battery_level: AtomicBool,
    diagnostics: Arc<SessionDiagnostics>,
    transport: Arc<dyn BleTransport>,
    events: mpsc::UnboundedSender<WearableEvent>,
    runtime: Handle,
}

impl DeviceSession {
    /// Create session `id` for the sensor at `address`
    #[must_use]
    pub fn new(
        id: u64,
        address: DeviceAddress,
        transport: Arc<dyn BleTransport>,
        timeouts: &TimeoutConfig,
        events: mpsc::UnboundedSender<WearableEvent>,
        runtime: Handle,
    ) -> Arc<Self> {
        let diagnostics = Arc::new(SessionDiagnostics::new(address));
        Arc::new(Self {
            id,
            address,
            commands: CommandChannel::new(
                transport.clone(),
                timeouts.command_timeout(),
                diagnostics.clone(),
            ),
            downloads: Arc::new(DownloadReassembler::new(
                timeouts.download_quiet_window(),
                runtime.clone(),
                events.clone(),
                diagnostics.clone(),
            )),
            battery: BatteryTracker::new(),
            battery_level: AtomicBool::new(false),
            diagnostics,
            transport,
            events,
            runtime,
        })
    }

    /// Session number, unique per device
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Address of the connected sensor
    #[must_use]
    pub const fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Command channel of this session
    #[must_use]
    pub const fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    /// Download reassembler of this session
    #[must_use]
    pub const fn downloads(&self) -> &Arc<DownloadReassembler> {
        &self.downloads
    }

    /// Current diagnostics counters
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Record whether the Battery Level characteristic is subscribed
    pub fn set_battery_level_available(&self, available: bool) {
        self.battery_level.store(available, Ordering::SeqCst);
    }

    fn emit(&self, event: WearableEvent) {
        if self.events.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }

    /// Handler for the control characteristic
    pub fn control_handler(self: &Arc<Self>) -> NotificationHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |data: &[u8]| {
            if let Some(session) = session.upgrade() {
                session.on_control(data);
            }
        })
    }

    /// Handler for the data stream characteristic
    pub fn data_stream_handler(self: &Arc<Self>) -> NotificationHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |data: &[u8]| {
            if let Some(session) = session.upgrade() {
                session.on_data_stream(data);
            }
        })
    }

    /// Handler for the download characteristic
    pub fn download_handler(self: &Arc<Self>) -> NotificationHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |data: &[u8]| {
            if let Some(session) = session.upgrade() {
                session.downloads.on_notification(data);
            }
        })
    }

    /// Handler for the standard Battery Level characteristic
    pub fn battery_level_handler(self: &Arc<Self>) -> NotificationHandler {
        let session = Arc::downgrade(self);
        Arc::new(move |data: &[u8]| {
            if let Some(session) = session.upgrade() {
                session.on_battery_level(data);
            }
        })
    }

    fn on_control(self: &Arc<Self>, data: &[u8]) {
        if let ControlNotification::BatteryStatus { charge } =
            self.commands.handle_notification(data)
        {
            let session = self.clone();
            self.runtime.spawn(async move {
                session.report_battery_status(charge).await;
            });
        }
    }

    async fn report_battery_status(&self, charge: u32) {
        let battery_percent = if self.battery_level.load(Ordering::SeqCst) {
            match self.transport.read(BATTERY_LEVEL_CHAR_UUID).await {
                Ok(value) => value.first().copied(),
                Err(e) => {
                    debug!("Battery level read failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let status = self
            .battery
            .record(charge, battery_percent, SystemTime::now());
        info!(
            "Battery status [{}]: charge={} level={:?}",
            status.elapsed_label(),
            status.charge,
            status.battery_percent
        );
        self.emit(WearableEvent::BatteryStatus(status));
    }

    fn on_data_stream(&self, data: &[u8]) {
        match telemetry::decode(data) {
            Ok(record) => {
                self.diagnostics.telemetry_decoded();
                trace!("Telemetry: {:?}", record);
                self.emit(WearableEvent::Telemetry(record));
            }
            Err(DecodeError::UnknownType(record_type)) => {
                self.diagnostics.telemetry_unknown();
                warn!("Unknown data type 0x{:02X}, ignoring packet", record_type);
            }
            Err(e) => {
                self.diagnostics.telemetry_dropped();
                trace!("Dropping data stream notification: {}", e);
            }
        }
    }

    fn on_battery_level(&self, data: &[u8]) {
        if let Some(&percent) = data.first() {
            debug!("Battery level {}%", percent);
            self.emit(WearableEvent::BatteryLevel(percent));
        }
    }

    /// Fail pending work and flush diagnostics
    ///
    /// Safe to call more than once.
    pub fn close(&self) -> DiagnosticsSnapshot {
        let failed = self.commands.fail_all();
        if failed > 0 {
            debug!("Failed {} pending command(s)", failed);
        }
        if let Some(partial) = self.downloads.abort() {
            warn!(
                "Download [{}] interrupted after {} record(s)",
                partial.file_timestamp,
                partial.records()
            );
        }
        self.battery.reset();
        self.diagnostics.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{control_response, MockTransport},
        telemetry::TelemetryRecord,
        DATA_STREAM_CHAR_UUID,
    };
    use tokio::sync::mpsc::error::TryRecvError;

    fn session(
        mock: &Arc<MockTransport>,
    ) -> (Arc<DeviceSession>, mpsc::UnboundedReceiver<WearableEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let session = DeviceSession::new(
            1,
            DeviceAddress(0xAABB),
            mock.clone(),
            &TimeoutConfig::default(),
            events,
            Handle::current(),
        );
        (session, receiver)
    }

    #[tokio::test]
    async fn test_telemetry_policy() {
        let mock = Arc::new(MockTransport::tymewear());
        let (session, mut events) = session(&mock);
        mock.set_notification_handler(DATA_STREAM_CHAR_UUID, session.data_stream_handler());

        let mut stretch = vec![0x03];
        stretch.extend_from_slice(&11u32.to_le_bytes());
        stretch.extend_from_slice(&512u16.to_le_bytes());

        mock.notify(DATA_STREAM_CHAR_UUID, &[0x03, 0x01]);
        mock.notify(DATA_STREAM_CHAR_UUID, &[0x42, 0x00, 0x00]);
        mock.notify(DATA_STREAM_CHAR_UUID, &[]);
        mock.notify(DATA_STREAM_CHAR_UUID, &stretch);

        let Ok(WearableEvent::Telemetry(TelemetryRecord::Stretch(record))) = events.try_recv()
        else {
            panic!("expected a stretch record");
        };
        assert_eq!(record.counter, 11);
        assert_eq!(record.value, 512);
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));

        let snapshot = session.diagnostics();
        assert_eq!(snapshot.telemetry_decoded, 1);
        assert_eq!(snapshot.telemetry_dropped, 2);
        assert_eq!(snapshot.telemetry_unknown, 1);
    }

    #[tokio::test]
    async fn test_battery_push_reads_level() {
        let mock = Arc::new(MockTransport::tymewear());
        let (session, mut events) = session(&mock);
        session.set_battery_level_available(true);

        session.on_control(&control_response(0x4002, 0, &3_900u32.to_le_bytes()));

        let Some(WearableEvent::BatteryStatus(status)) = events.recv().await else {
            panic!("expected a battery status");
        };
        assert_eq!(status.charge, 3_900);
        assert_eq!(status.battery_percent, Some(87));
        assert_eq!(status.elapsed_label(), "00:00");
    }

    #[tokio::test]
    async fn test_battery_push_without_level() {
        let mock = Arc::new(MockTransport::tymewear());
        let (session, mut events) = session(&mock);

        session.on_control(&control_response(0x4002, 0, &10u32.to_le_bytes()));
        let Some(WearableEvent::BatteryStatus(status)) = events.recv().await else {
            panic!("expected a battery status");
        };
        assert_eq!(status.battery_percent, None);
    }

    #[tokio::test]
    async fn test_battery_level_notification() {
        let mock = Arc::new(MockTransport::tymewear());
        let (session, mut events) = session(&mock);
        let handler = session.battery_level_handler();

        handler(&[64]);
        handler(&[]);
        assert_eq!(events.try_recv(), Ok(WearableEvent::BatteryLevel(64)));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_handlers_do_not_keep_session_alive() {
        let mock = Arc::new(MockTransport::tymewear());
        let (session, mut events) = session(&mock);
        let handler = session.data_stream_handler();
        drop(session);

        handler(&[0x05, 1, 0, 0, 0, 60, 0]);
        assert!(matches!(
            events.try_recv(),
            Err(TryRecvError::Empty | TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = Arc::new(MockTransport::tymewear());
        let (session, _events) = session(&mock);
        session.close();
        let snapshot = session.close();
        assert_eq!(snapshot.control_notifications, 0);
        assert!(session.commands().is_closed());
    }
}
