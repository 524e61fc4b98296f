use crate::{
    diagnostics::DiagnosticsSnapshot,
    download::{DownloadSummary, DownloadWriter},
    error::{CommandError, ConnectionError, Result, TymewearError},
    protocol::{parse_file_list, parse_hardware_info, ControlResponse, Opcode},
    scanner::Scanner,
    session::DeviceSession,
    transport::{BleTransport, DisconnectHandler, NotificationHandler},
    types::{
        ConnectionParams, ConnectionState, DeviceAddress, DiscoveredDevice, FileEntry,
        HardwareInfo, TimeoutConfig, WearableEvent,
    },
    BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, CONTROL_CHAR_UUID, DATA_STREAM_CHAR_UUID,
    DOWNLOAD_CHAR_UUID, SERVICE_UUID,
};
use bytes::Bytes;
use std::{
    future::Future,
    io::Write,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, Mutex, RwLock},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client for one Tyme Wear sensor
///
/// `TymewearDevice` drives the connection lifecycle, issues control commands,
/// and turns notifications into [`WearableEvent`]s delivered on the receiver
/// returned by the constructor. It works over any [`BleTransport`]; use
/// [`BtleplugTransport`](crate::BtleplugTransport) for real hardware and
/// [`MockTransport`](crate::MockTransport) in tests.
///
/// # Connection lifecycle
///
/// `Disconnected → Connecting → DiscoveringService → SettingUpCharacteristics → Connected`,
/// then `Disconnecting → Disconnected` on [`disconnect`](Self::disconnect) or link loss.
/// A failed or cancelled connect tears down whatever was acquired and returns
/// to `Disconnected`.
///
/// # Examples
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
/// use tymewear::{BtleplugTransport, TymewearDevice, WearableEvent};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let transport = Arc::new(BtleplugTransport::new().await?);
///     let (device, mut events) = TymewearDevice::new(transport);
///
///     let found = device.scan_for(Duration::from_secs(5)).await?;
///     let Some(sensor) = found.first() else {
///         return Ok(());
///     };
///     device.connect(sensor.address).await?;
///     device.start_activity().await?;
///
///     while let Some(event) = events.recv().await {
///         if let WearableEvent::Telemetry(record) = event {
///             println!("{record:?}");
///         }
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct TymewearDevice {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    transport: Arc<dyn BleTransport>,
    params: ConnectionParams,
    timeouts: TimeoutConfig,
    events: mpsc::UnboundedSender<WearableEvent>,
    state: RwLock<ConnectionState>,
    session: Mutex<Option<Arc<DeviceSession>>>,
    files: RwLock<Vec<FileEntry>>,
    scanner: Scanner,
    next_session_id: AtomicU64,
}

impl TymewearDevice {
    /// Create a device with default parameters
    ///
    /// Returns the device and the receiver for its events.
    #[must_use]
    pub fn new(
        transport: Arc<dyn BleTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<WearableEvent>) {
        Self::with_config(transport, ConnectionParams::default(), TimeoutConfig::default())
    }

    /// Create a device with custom connection parameters and timeouts
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use tymewear::{ConnectionParams, MockTransport, TimeoutConfig, TymewearDevice};
    ///
    /// let params = ConnectionParams {
    ///     subscribe_battery: false,
    ///     ..Default::default()
    /// };
    /// let timeouts = TimeoutConfig {
    ///     command_timeout_ms: 5_000,
    ///     ..Default::default()
    /// };
    /// let (device, _events) =
    ///     TymewearDevice::with_config(Arc::new(MockTransport::tymewear()), params, timeouts);
    /// ```
    #[must_use]
    pub fn with_config(
        transport: Arc<dyn BleTransport>,
        params: ConnectionParams,
        timeouts: TimeoutConfig,
    ) -> (Self, mpsc::UnboundedReceiver<WearableEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let scanner = Scanner::new(transport.clone(), &timeouts, events.clone());
        let inner = DeviceInner {
            transport,
            params,
            timeouts,
            events,
            state: RwLock::new(ConnectionState::Disconnected),
            session: Mutex::new(None),
            files: RwLock::new(Vec::new()),
            scanner,
            next_session_id: AtomicU64::new(1),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Advertisement scanner shared with this device
    #[must_use]
    pub fn scanner(&self) -> &Scanner {
        &self.inner.scanner
    }

    /// Start scanning for sensors
    ///
    /// # Errors
    ///
    /// Returns any transport error from starting the scan.
    pub async fn start_scan(&self) -> Result<()> {
        self.inner.scanner.start().await
    }

    /// Stop scanning
    ///
    /// # Errors
    ///
    /// Returns any transport error from stopping the scan.
    pub async fn stop_scan(&self) -> Result<()> {
        self.inner.scanner.stop().await
    }

    /// Scan for `duration` and return the sensors found, strongest signal first
    ///
    /// # Errors
    ///
    /// Returns any transport error from starting or stopping the scan.
    pub async fn scan_for(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.inner.scanner.start().await?;
        tokio::time::sleep(duration).await;
        self.inner.scanner.stop().await?;
        let devices = self.inner.scanner.devices();
        info!("Scan completed. Found {} Tyme Wear device(s)", devices.len());
        Ok(devices)
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Whether a session is established
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Address of the connected sensor
    pub async fn address(&self) -> Option<DeviceAddress> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.address())
    }

    /// Diagnostics counters of the current session
    pub async fn diagnostics(&self) -> Option<DiagnosticsSnapshot> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.diagnostics())
    }

    /// Connect to the sensor at `address`
    ///
    /// Stops a running scan and tears down any previous session first.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::ServiceNotFound`] if the Tyme Wear service never shows up
    /// - [`ConnectionError::CharacteristicNotFound`] if a required characteristic is missing
    /// - [`ConnectionError::NotifyEnableFailed`] if notifications cannot be enabled
    /// - Any transport error while resolving or connecting the device
    pub async fn connect(&self, address: DeviceAddress) -> Result<()> {
        self.connect_cancellable(address, std::future::pending()).await
    }

    /// Connect to the sensor at `address`, giving up when `cancel` completes
    ///
    /// # Errors
    ///
    /// Returns [`TymewearError::Cancelled`] if `cancel` completes first, and
    /// otherwise the same errors as [`connect`](Self::connect).
    pub async fn connect_cancellable<F>(&self, address: DeviceAddress, cancel: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let inner = &self.inner;
        let mut slot = inner.session.lock().await;

        if inner.scanner.is_scanning() {
            if let Err(e) = inner.scanner.stop().await {
                warn!("Failed to stop scan before connecting: {}", e);
            }
        }
        if let Some(previous) = slot.take() {
            inner.close_session(&previous).await;
        }
        inner.files.write().await.clear();

        let runtime = Handle::current();
        let session = DeviceSession::new(
            inner.next_session_id.fetch_add(1, Ordering::Relaxed),
            address,
            inner.transport.clone(),
            &inner.timeouts,
            inner.events.clone(),
            runtime.clone(),
        );

        let outcome = tokio::select! {
            result = inner.establish(&session) => result,
            () = cancel => Err(TymewearError::Cancelled),
        };
        if let Err(e) = outcome {
            warn!("Connection to {} failed: {}", address.display_name(), e);
            inner.teardown(&session).await;
            return Err(e);
        }

        inner
            .transport
            .set_disconnect_handler(Some(link_loss_handler(inner, session.id(), runtime)));
        *slot = Some(session.clone());
        inner.set_state(ConnectionState::Connected).await;
        info!("Connected to {}", address.display_name());
        inner.emit(WearableEvent::Connected { address });

        if inner.params.subscribe_battery {
            inner.subscribe_battery(&session).await;
        }
        Ok(())
    }

    /// Disconnect from the sensor
    ///
    /// Always leaves the device `Disconnected`; calling it without a session is not an error.
    ///
    /// # Errors
    ///
    /// Teardown is best-effort, so this currently always succeeds.
    pub async fn disconnect(&self) -> Result<()> {
        let mut slot = self.inner.session.lock().await;
        match slot.take() {
            Some(session) => self.inner.close_session(&session).await,
            None => self.inner.set_state(ConnectionState::Disconnected).await,
        }
        Ok(())
    }

    async fn session(&self) -> Result<Arc<DeviceSession>> {
        self.inner
            .session
            .lock()
            .await
            .clone()
            .ok_or_else(|| CommandError::NotConnected.into())
    }

    /// Send a raw control command and return the response whatever its code
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::NotConnected`] without a session,
    /// [`CommandError::Timeout`] if the sensor does not answer, or a transport error.
    pub async fn send_command(&self, opcode: Opcode, param: Option<u32>) -> Result<ControlResponse> {
        self.session().await?.commands().send(opcode, param).await
    }

    async fn execute(&self, opcode: Opcode, param: Option<u32>) -> Result<ControlResponse> {
        info!("{}", opcode);
        let response = self.send_command(opcode, param).await?;
        if !response.is_success() {
            warn!("{} answered {}", opcode, response.name());
            return Err(CommandError::Rejected {
                opcode,
                code: response.code,
            }
            .into());
        }
        Ok(response)
    }

    /// Read the hardware information block
    ///
    /// # Errors
    ///
    /// Returns the command errors of [`send_command`](Self::send_command),
    /// [`CommandError::Rejected`] on a non-success answer, or
    /// [`TymewearError::Parse`] if the payload is truncated.
    pub async fn get_info(&self) -> Result<HardwareInfo> {
        let response = self.execute(Opcode::GetInfo, None).await?;
        let info = parse_hardware_info(&response.payload)?;
        info!(
            "Firmware {} hardware {} status 0x{:02X}",
            info.firmware_version(),
            info.hw_version,
            info.hw_status
        );
        Ok(info)
    }

    /// Start recording an activity
    ///
    /// # Errors
    ///
    /// Returns the command errors of [`send_command`](Self::send_command) or
    /// [`CommandError::Rejected`] on a non-success answer.
    pub async fn start_activity(&self) -> Result<()> {
        self.execute(Opcode::StartActivity, None).await.map(drop)
    }

    /// Stop recording the current activity
    ///
    /// # Errors
    ///
    /// See [`start_activity`](Self::start_activity).
    pub async fn stop_activity(&self) -> Result<()> {
        self.execute(Opcode::StopActivity, None).await.map(drop)
    }

    /// Erase every stored recording
    ///
    /// # Errors
    ///
    /// See [`start_activity`](Self::start_activity).
    pub async fn erase_files(&self) -> Result<()> {
        self.execute(Opcode::EraseFiles, None).await?;
        self.inner.files.write().await.clear();
        Ok(())
    }

    /// Set the sensor clock to the current Unix time
    ///
    /// # Errors
    ///
    /// See [`start_activity`](Self::start_activity).
    pub async fn sync_rtc(&self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let timestamp = u32::try_from(now).unwrap_or(u32::MAX);
        self.execute(Opcode::SyncRtc, Some(timestamp)).await.map(drop)
    }

    /// Start streaming raw stretch values
    ///
    /// # Errors
    ///
    /// See [`start_activity`](Self::start_activity).
    pub async fn start_stretch(&self) -> Result<()> {
        self.execute(Opcode::StartStretch, None).await.map(drop)
    }

    /// Stop streaming raw stretch values
    ///
    /// # Errors
    ///
    /// See [`start_activity`](Self::start_activity).
    pub async fn stop_stretch(&self) -> Result<()> {
        self.execute(Opcode::StopStretch, None).await.map(drop)
    }

    /// Run the factory calibration and return its raw result
    ///
    /// # Errors
    ///
    /// See [`start_activity`](Self::start_activity).
    pub async fn factory_calibration(&self) -> Result<Bytes> {
        Ok(self.execute(Opcode::FactoryCalibration, None).await?.payload)
    }

    /// List the recordings stored on the sensor
    ///
    /// The result is cached and available from [`files`](Self::files).
    ///
    /// # Errors
    ///
    /// See [`start_activity`](Self::start_activity).
    pub async fn list_files(&self) -> Result<Vec<FileEntry>> {
        let response = self.execute(Opcode::ListFiles, None).await?;
        let files = parse_file_list(&response.payload);
        info!("File list: {}", files.len());
        self.inner.files.write().await.clone_from(&files);
        Ok(files)
    }

    /// Recordings returned by the last [`list_files`](Self::list_files)
    pub async fn files(&self) -> Vec<FileEntry> {
        self.inner.files.read().await.clone()
    }

    /// Download a recording into `out`
    ///
    /// Returns once the sensor has been silent for the quiet window.
    ///
    /// # Errors
    ///
    /// - [`TymewearError::DownloadInProgress`] if another download is open
    /// - [`CommandError::NotConnected`] without a session or if the link drops mid-transfer
    /// - The errors of the DATA_DUMP command, see [`start_activity`](Self::start_activity)
    pub async fn download_file(
        &self,
        entry: &FileEntry,
        out: impl Write + Send + 'static,
    ) -> Result<DownloadSummary> {
        self.download_file_cancellable(entry, out, std::future::pending())
            .await
    }

    /// Download a recording into `out`, giving up when `cancel` completes
    ///
    /// Cancelling tears the session down and leaves the device `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`TymewearError::Cancelled`] if `cancel` completes first, and
    /// otherwise the same errors as [`download_file`](Self::download_file).
    pub async fn download_file_cancellable<F>(
        &self,
        entry: &FileEntry,
        out: impl Write + Send + 'static,
        cancel: F,
    ) -> Result<DownloadSummary>
    where
        F: Future<Output = ()>,
    {
        let session = self.session().await?;
        let completion = session
            .downloads()
            .begin(entry.timestamp, DownloadWriter::new(out))?;

        let transfer = async {
            info!("{} [{}]", Opcode::DataDump, entry.timestamp);
            let response = session
                .commands()
                .send(Opcode::DataDump, Some(entry.timestamp))
                .await?;
            if !response.is_success() {
                return Err(CommandError::Rejected {
                    opcode: Opcode::DataDump,
                    code: response.code,
                }
                .into());
            }
            completion
                .await
                .map_err(|_| TymewearError::from(CommandError::NotConnected))
        };

        let outcome = tokio::select! {
            result = transfer => result,
            () = cancel => Err(TymewearError::Cancelled),
        };
        if let Err(e) = &outcome {
            session.downloads().abort();
            if matches!(e, TymewearError::Cancelled) {
                info!("Download [{}] cancelled", entry.timestamp);
                self.disconnect().await?;
            }
        }
        outcome
    }
}

fn link_loss_handler(inner: &Arc<DeviceInner>, session_id: u64, runtime: Handle) -> DisconnectHandler {
    let inner = Arc::downgrade(inner);
    Arc::new(move || {
        if let Some(inner) = inner.upgrade() {
            runtime.spawn(async move {
                inner.handle_link_loss(session_id).await;
            });
        }
    })
}

impl DeviceInner {
    fn emit(&self, event: WearableEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
        debug!("State: {}", state);
    }

    async fn establish(&self, session: &Arc<DeviceSession>) -> Result<()> {
        let address = session.address();

        self.set_state(ConnectionState::Connecting).await;
        info!("Connecting to {} ({})", address.display_name(), address);
        self.transport.connect(address).await?;
        tokio::time::sleep(Duration::from_millis(self.params.settle_delay_ms)).await;

        self.set_state(ConnectionState::DiscoveringService).await;
        self.discover_service().await?;

        self.set_state(ConnectionState::SettingUpCharacteristics).await;
        let characteristics: [(Uuid, NotificationHandler); 3] = [
            (CONTROL_CHAR_UUID, session.control_handler()),
            (DATA_STREAM_CHAR_UUID, session.data_stream_handler()),
            (DOWNLOAD_CHAR_UUID, session.download_handler()),
        ];
        for (uuid, handler) in characteristics {
            self.setup_characteristic(uuid, handler).await?;
        }
        Ok(())
    }

    async fn discover_service(&self) -> Result<()> {
        let attempts = self.params.service_discovery_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.discover_service(SERVICE_UUID).await {
                Ok(true) => {
                    debug!("Service found on attempt {}", attempt);
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Service discovery attempt {}/{} found nothing", attempt, attempts);
                }
                Err(e) => {
                    debug!("Service discovery attempt {}/{} failed: {}", attempt, attempts, e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(
                    self.params.service_discovery_backoff_ms,
                ))
                .await;
            }
        }
        Err(ConnectionError::ServiceNotFound { attempts }.into())
    }

    async fn setup_characteristic(&self, uuid: Uuid, handler: NotificationHandler) -> Result<()> {
        if !self.transport.has_characteristic(SERVICE_UUID, uuid).await? {
            return Err(ConnectionError::CharacteristicNotFound { uuid }.into());
        }
        self.transport.set_notification_handler(uuid, handler);

        if self.try_enable_notify(uuid).await {
            return Ok(());
        }
        debug!("Notify on {} not confirmed, retrying", uuid);
        tokio::time::sleep(Duration::from_millis(self.params.notify_retry_delay_ms)).await;
        if self.try_enable_notify(uuid).await {
            Ok(())
        } else {
            Err(ConnectionError::NotifyEnableFailed { uuid }.into())
        }
    }

    async fn try_enable_notify(&self, uuid: Uuid) -> bool {
        match self.transport.enable_notify(uuid).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                debug!("Enabling notify on {} failed: {}", uuid, e);
                false
            }
        }
    }

    async fn subscribe_battery(&self, session: &Arc<DeviceSession>) {
        match self.try_subscribe_battery(session).await {
            Ok(true) => debug!("Subscribed to battery level"),
            Ok(false) => debug!("Battery level not available"),
            Err(e) => warn!("Battery level subscription failed: {}", e),
        }
    }

    async fn try_subscribe_battery(&self, session: &Arc<DeviceSession>) -> Result<bool> {
        if !self.transport.discover_service(BATTERY_SERVICE_UUID).await?
            || !self
                .transport
                .has_characteristic(BATTERY_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID)
                .await?
        {
            return Ok(false);
        }

        self.transport
            .set_notification_handler(BATTERY_LEVEL_CHAR_UUID, session.battery_level_handler());
        if !self.transport.enable_notify(BATTERY_LEVEL_CHAR_UUID).await? {
            self.transport.clear_notification_handler(BATTERY_LEVEL_CHAR_UUID);
            return Ok(false);
        }
        session.set_battery_level_available(true);

        if let Some(&percent) = self.transport.read(BATTERY_LEVEL_CHAR_UUID).await?.first() {
            self.emit(WearableEvent::BatteryLevel(percent));
        }
        Ok(true)
    }

    /// Release everything a session may hold; safe on partially set up sessions
    async fn teardown(&self, session: &DeviceSession) {
        self.set_state(ConnectionState::Disconnecting).await;
        self.transport.set_disconnect_handler(None);
        session.close();

        for uuid in [
            CONTROL_CHAR_UUID,
            DATA_STREAM_CHAR_UUID,
            DOWNLOAD_CHAR_UUID,
            BATTERY_LEVEL_CHAR_UUID,
        ] {
            self.transport.clear_notification_handler(uuid);
            if let Err(e) = self.transport.disable_notify(uuid).await {
                debug!("Disabling notify on {} failed: {}", uuid, e);
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("Failed to release device: {}", e);
        }
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn close_session(&self, session: &DeviceSession) {
        let address = session.address();
        info!("Disconnecting from {}", address.display_name());
        self.teardown(session).await;
        self.emit(WearableEvent::Disconnected { address });
    }

    async fn handle_link_loss(&self, session_id: u64) {
        let mut slot = self.session.lock().await;
        let session = match slot.take() {
            Some(session) if session.id() == session_id => session,
            other => {
                *slot = other;
                return;
            }
        };
        warn!("Link to {} lost", session.address().display_name());
        self.close_session(&session).await;
    }
}
