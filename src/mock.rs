//! In-memory [`BleTransport`] for tests and demos
//!
//! The mock models one Tyme Wear peripheral. Failures are injected through
//! setters, and notifications are pushed with [`MockTransport::notify`],
//! which runs the registered handler synchronously on the caller's thread.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::trace;
use uuid::Uuid;

use crate::{
    error::{Result, TymewearError},
    protocol::SUCCESS_CODE,
    transport::{AdvertisementHandler, BleTransport, DisconnectHandler, NotificationHandler},
    types::{Advertisement, DeviceAddress},
    BATTERY_LEVEL_CHAR_UUID, BATTERY_SERVICE_UUID, CONTROL_CHAR_UUID, DATA_STREAM_CHAR_UUID,
    DOWNLOAD_CHAR_UUID, SERVICE_UUID,
};

/// Computes the notifications a write provokes, as `(characteristic, value)` pairs
pub type Responder = Arc<dyn Fn(Uuid, &[u8]) -> Vec<(Uuid, Vec<u8>)> + Send + Sync>;

/// A transport call recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `start_scan`
    StartScan,
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(DeviceAddress),
    /// `discover_service`
    DiscoverService(Uuid),
    /// `enable_notify`
    EnableNotify(Uuid),
    /// `disable_notify`
    DisableNotify(Uuid),
    /// `write`
    Write(Uuid),
    /// `read`
    Read(Uuid),
    /// `disconnect`
    Disconnect,
}

#[derive(Default)]
struct MockState {
    services: HashSet<Uuid>,
    characteristics: HashSet<(Uuid, Uuid)>,
    read_values: HashMap<Uuid, Vec<u8>>,
    reject_connect: bool,
    discover_misses: u32,
    discover_errors: u32,
    notify_failures: HashMap<Uuid, u32>,
    fail_writes: bool,
    responder: Option<Responder>,
    notification_handlers: HashMap<Uuid, NotificationHandler>,
    scan_handler: Option<AdvertisementHandler>,
    disconnect_handler: Option<DisconnectHandler>,
    notifying: HashSet<Uuid>,
    connected: Option<DeviceAddress>,
    writes: Vec<(Uuid, Vec<u8>)>,
    calls: Vec<MockCall>,
}

/// Scriptable in-memory peripheral
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create a peripheral exposing no services
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a peripheral exposing the Tyme Wear service and the Battery service
    ///
    /// The Battery Level characteristic reads as 87%.
    #[must_use]
    pub fn tymewear() -> Self {
        let mock = Self::new();
        {
            let mut state = mock.lock();
            state.services.extend([SERVICE_UUID, BATTERY_SERVICE_UUID]);
            for characteristic in [CONTROL_CHAR_UUID, DATA_STREAM_CHAR_UUID, DOWNLOAD_CHAR_UUID] {
                state.characteristics.insert((SERVICE_UUID, characteristic));
            }
            state
                .characteristics
                .insert((BATTERY_SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID));
            state.read_values.insert(BATTERY_LEVEL_CHAR_UUID, vec![87]);
        }
        mock
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a service and all of its characteristics
    pub fn remove_service(&self, service: Uuid) {
        let mut state = self.lock();
        state.services.remove(&service);
        state.characteristics.retain(|(s, _)| *s != service);
    }

    /// Remove a characteristic from every service
    pub fn remove_characteristic(&self, characteristic: Uuid) {
        self.lock()
            .characteristics
            .retain(|(_, c)| *c != characteristic);
    }

    /// Make `connect` fail with [`TymewearError::DeviceNotFound`]
    pub fn reject_connect(&self, reject: bool) {
        self.lock().reject_connect = reject;
    }

    /// Make the next `attempts` service discoveries report nothing
    pub fn miss_service_discovery(&self, attempts: u32) {
        self.lock().discover_misses = attempts;
    }

    /// Make the next `attempts` service discoveries fail with a transport error
    pub fn fail_service_discovery(&self, attempts: u32) {
        self.lock().discover_errors = attempts;
    }

    /// Make the next `attempts` notify enables on `characteristic` go unconfirmed
    pub fn fail_notify(&self, characteristic: Uuid, attempts: u32) {
        self.lock().notify_failures.insert(characteristic, attempts);
    }

    /// Make every write fail
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Set the value returned by reads of `characteristic`
    pub fn set_read_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.lock().read_values.insert(characteristic, value);
    }

    /// Install the responder run after every successful write
    pub fn set_responder(&self, responder: Responder) {
        self.lock().responder = Some(responder);
    }

    /// Answer every control command with a bare success response
    pub fn respond_with_success(&self) {
        self.set_responder(Arc::new(|characteristic, data: &[u8]| {
            match tag_of(data) {
                Some(tag) if characteristic == CONTROL_CHAR_UUID => {
                    vec![(CONTROL_CHAR_UUID, control_response(SUCCESS_CODE, tag, &[]))]
                }
                _ => Vec::new(),
            }
        }));
    }

    /// Deliver a notification to the handler registered for `characteristic`
    ///
    /// Returns false when no handler is registered.
    pub fn notify(&self, characteristic: Uuid, data: &[u8]) -> bool {
        let handler = self.lock().notification_handlers.get(&characteristic).cloned();
        match handler {
            Some(handler) => {
                trace!("Mock notify {}: {:02X?}", characteristic, data);
                handler(data);
                true
            }
            None => false,
        }
    }

    /// Deliver an advertisement report to the scan handler
    ///
    /// Returns false when no scan is running.
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        let handler = self.lock().scan_handler.clone();
        handler.map_or(false, |handler| {
            handler(advertisement);
            true
        })
    }

    /// Simulate the peripheral dropping the link
    pub fn drop_link(&self) {
        let handler = {
            let mut state = self.lock();
            state.connected = None;
            state.notifying.clear();
            state.disconnect_handler.clone()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Every write so far
    #[must_use]
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.lock().writes.clone()
    }

    /// Every transport call so far
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls equal to `call`
    #[must_use]
    pub fn call_count(&self, call: &MockCall) -> usize {
        self.lock().calls.iter().filter(|c| *c == call).count()
    }

    /// Whether a peripheral is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().connected.is_some()
    }

    /// Whether a scan is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.lock().scan_handler.is_some()
    }

    /// Whether notifications are enabled on `characteristic`
    #[must_use]
    pub fn is_notifying(&self, characteristic: Uuid) -> bool {
        self.lock().notifying.contains(&characteristic)
    }

    /// Whether a notification handler is registered for `characteristic`
    #[must_use]
    pub fn has_handler(&self, characteristic: Uuid) -> bool {
        self.lock().notification_handlers.contains_key(&characteristic)
    }

    /// Whether a link-loss handler is registered
    #[must_use]
    pub fn has_disconnect_handler(&self) -> bool {
        self.lock().disconnect_handler.is_some()
    }
}

/// Build a control response frame
#[must_use]
pub fn control_response(code: u16, tag: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&code.to_le_bytes());
    frame.extend_from_slice(&tag.to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Opcode of a command frame written to the control characteristic
#[must_use]
pub fn opcode_of(command: &[u8]) -> Option<u16> {
    command.get(0..2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Tag of a command frame written to the control characteristic
#[must_use]
pub fn tag_of(command: &[u8]) -> Option<u16> {
    command.get(2..4).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn start_scan(&self, handler: AdvertisementHandler) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::StartScan);
        state.scan_handler = Some(handler);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::StopScan);
        state.scan_handler = None;
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::Connect(address));
        if state.reject_connect {
            return Err(TymewearError::DeviceNotFound);
        }
        state.connected = Some(address);
        Ok(())
    }

    async fn discover_service(&self, service: Uuid) -> Result<bool> {
        let mut state = self.lock();
        state.calls.push(MockCall::DiscoverService(service));
        if state.discover_errors > 0 {
            state.discover_errors -= 1;
            return Err(TymewearError::Transport("GATT unreachable".to_string()));
        }
        if state.discover_misses > 0 {
            state.discover_misses -= 1;
            return Ok(false);
        }
        Ok(state.services.contains(&service))
    }

    async fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<bool> {
        Ok(self.lock().characteristics.contains(&(service, characteristic)))
    }

    fn set_notification_handler(&self, characteristic: Uuid, handler: NotificationHandler) {
        self.lock()
            .notification_handlers
            .insert(characteristic, handler);
    }

    fn clear_notification_handler(&self, characteristic: Uuid) {
        self.lock().notification_handlers.remove(&characteristic);
    }

    fn set_disconnect_handler(&self, handler: Option<DisconnectHandler>) {
        self.lock().disconnect_handler = handler;
    }

    async fn enable_notify(&self, characteristic: Uuid) -> Result<bool> {
        let mut state = self.lock();
        state.calls.push(MockCall::EnableNotify(characteristic));
        if let Some(remaining) = state.notify_failures.get_mut(&characteristic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(false);
            }
        }
        let known = state.characteristics.iter().any(|(_, c)| *c == characteristic);
        if known {
            state.notifying.insert(characteristic);
        }
        Ok(known)
    }

    async fn disable_notify(&self, characteristic: Uuid) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::DisableNotify(characteristic));
        state.notifying.remove(&characteristic);
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let responder = {
            let mut state = self.lock();
            state.calls.push(MockCall::Write(characteristic));
            if state.fail_writes {
                return Err(TymewearError::Transport("write rejected".to_string()));
            }
            state.writes.push((characteristic, data.to_vec()));
            state.responder.clone()
        };

        if let Some(responder) = responder {
            for (target, value) in responder(characteristic, data) {
                self.notify(target, &value);
            }
        }
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let mut state = self.lock();
        state.calls.push(MockCall::Read(characteristic));
        state
            .read_values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| TymewearError::Transport(format!("{characteristic} is not readable")))
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(MockCall::Disconnect);
        state.connected = None;
        state.notifying.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_tymewear_layout() {
        let mock = MockTransport::tymewear();
        assert!(mock.discover_service(SERVICE_UUID).await.unwrap());
        assert!(mock
            .has_characteristic(SERVICE_UUID, DOWNLOAD_CHAR_UUID)
            .await
            .unwrap());
        assert!(!mock
            .has_characteristic(SERVICE_UUID, BATTERY_LEVEL_CHAR_UUID)
            .await
            .unwrap());
        assert_eq!(mock.read(BATTERY_LEVEL_CHAR_UUID).await.unwrap(), vec![87]);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let mock = MockTransport::tymewear();
        mock.miss_service_discovery(1);
        mock.fail_notify(CONTROL_CHAR_UUID, 1);

        assert!(!mock.discover_service(SERVICE_UUID).await.unwrap());
        assert!(mock.discover_service(SERVICE_UUID).await.unwrap());
        assert!(!mock.enable_notify(CONTROL_CHAR_UUID).await.unwrap());
        assert!(mock.enable_notify(CONTROL_CHAR_UUID).await.unwrap());
        assert!(mock.is_notifying(CONTROL_CHAR_UUID));
    }

    #[tokio::test]
    async fn test_responder_notifies_registered_handler() {
        let mock = MockTransport::tymewear();
        mock.respond_with_success();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        mock.set_notification_handler(
            CONTROL_CHAR_UUID,
            Arc::new(move |data: &[u8]| sink.lock().unwrap().push(data.to_vec())),
        );

        mock.write(CONTROL_CHAR_UUID, &[0x09, 0x01, 0x07, 0x00])
            .await
            .unwrap();
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[vec![0x00, 0x80, 0x07, 0x00]]
        );
        assert_eq!(mock.call_count(&MockCall::Write(CONTROL_CHAR_UUID)), 1);
    }

    #[tokio::test]
    async fn test_drop_link_runs_disconnect_handler() {
        let mock = MockTransport::tymewear();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        mock.connect(DeviceAddress(7)).await.unwrap();
        mock.set_disconnect_handler(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        mock.drop_link();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!mock.is_connected());
    }

    #[test]
    fn test_frame_helpers() {
        let command = [0x2C, 0x00, 0x05, 0x01];
        assert_eq!(opcode_of(&command), Some(0x002C));
        assert_eq!(tag_of(&command), Some(0x0105));
        assert_eq!(tag_of(&command[..3]), None);
        assert_eq!(control_response(0x8000, 2, &[9]), vec![0x00, 0x80, 0x02, 0x00, 0x09]);
    }
}
