use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{Advertisement, DeviceAddress},
};

/// Callback for characteristic notifications; may run on any thread
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback for advertisement reports; may run on any thread
pub type AdvertisementHandler = Arc<dyn Fn(Advertisement) + Send + Sync>;

/// Callback for an unexpected loss of the link to the connected peripheral
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Platform BLE capabilities the protocol engine is built on
///
/// One transport drives at most one connected peripheral. Implementations
/// deliver notifications to the handler registered for the characteristic
/// that produced them, from whatever thread the platform uses.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start an active advertisement scan
    async fn start_scan(&self, handler: AdvertisementHandler) -> Result<()>;

    /// Stop the advertisement scan; stopping an idle scan is not an error
    async fn stop_scan(&self) -> Result<()>;

    /// Resolve and connect the peripheral at `address`
    async fn connect(&self, address: DeviceAddress) -> Result<()>;

    /// Run service discovery and report whether `service` is present
    async fn discover_service(&self, service: Uuid) -> Result<bool>;

    /// Report whether `service` exposes `characteristic`
    async fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<bool>;

    /// Route notifications of `characteristic` to `handler`, replacing any previous one
    fn set_notification_handler(&self, characteristic: Uuid, handler: NotificationHandler);

    /// Stop routing notifications of `characteristic`
    fn clear_notification_handler(&self, characteristic: Uuid);

    /// Register the link-loss callback; `None` removes it
    fn set_disconnect_handler(&self, handler: Option<DisconnectHandler>);

    /// Enable notifications; `Ok(false)` when the peripheral did not confirm
    async fn enable_notify(&self, characteristic: Uuid) -> Result<bool>;

    /// Disable notifications
    async fn disable_notify(&self, characteristic: Uuid) -> Result<()>;

    /// Write a value to `characteristic`
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Read the current value of `characteristic`
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Release the peripheral; releasing when nothing is connected is not an error
    async fn disconnect(&self) -> Result<()>;
}
