use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration, time::SystemTime};
use uuid::Uuid;

use crate::{battery::BatteryStatus, download::DownloadSummary, telemetry::TelemetryRecord};

/// Connection lifecycle of the device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// Resolving the device handle
    Connecting,
    /// Looking for the custom service
    DiscoveringService,
    /// Acquiring characteristics and enabling notifications
    SettingUpCharacteristics,
    /// Session ready for commands
    Connected,
    /// Tearing the session down
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringService => write!(f, "Discovering Service"),
            Self::SettingUpCharacteristics => write!(f, "Setting Up Characteristics"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// 48-bit Bluetooth device address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    /// Address as six big-endian bytes
    #[must_use]
    pub fn to_bytes(self) -> [u8; 6] {
        let raw = self.0.to_be_bytes();
        [raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]
    }

    /// Build an address from six big-endian bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut raw = [0u8; 8];
        raw[2..].copy_from_slice(&bytes);
        Self(u64::from_be_bytes(raw))
    }

    /// Display name the sensors are known by: `TYME-` and the last four hex digits
    #[must_use]
    pub fn display_name(self) -> String {
        format!("TYME-{:04X}", self.0 & 0xFFFF)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012X}", self.0)
    }
}

/// One advertisement report delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Advertiser address
    pub address: DeviceAddress,
    /// Advertised local name, if any
    pub local_name: Option<String>,
    /// Signal strength in dBm
    pub rssi: i16,
    /// Advertised service UUIDs
    pub services: Vec<Uuid>,
}

/// A sensor seen during scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Device address
    pub address: DeviceAddress,
    /// Display name (`TYME-XXXX`)
    pub name: String,
    /// Most recent signal strength in dBm
    pub rssi: i16,
    /// When the last advertisement was received
    pub last_seen: SystemTime,
}

/// One stored recording, as reported by LIST_FILES
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    /// Recording start time (Unix seconds); identifies the file
    pub timestamp: u32,
    /// First flash address
    pub start_addr: u32,
    /// End flash address
    pub end_addr: u32,
}

impl FileEntry {
    /// Size in bytes
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.end_addr.saturating_sub(self.start_addr)
    }

    /// File name for the decoded text of this recording
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("file_{}.txt", self.timestamp)
    }
}

impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.timestamp, self.size())
    }
}

/// Hardware information block returned by GET_INFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// Firmware version; the low byte is the minor version
    pub sw_version: u16,
    /// Hardware revision
    pub hw_version: u8,
    /// IMU sample period in milliseconds
    pub imu_period_ms: u16,
    /// Data point period in milliseconds
    pub data_point_period_ms: u16,
    /// Hardware status flags
    pub hw_status: u8,
    /// Base stretch calibration
    pub base_calibration: u16,
    /// User tidal volume calibration
    pub user_vt_calibration: u16,
    /// Device clock (Unix seconds)
    pub current_rtc: u32,
    /// Start of the last activity (Unix seconds)
    pub activity_start: u32,
    /// Activity detection threshold
    pub activity_threshold: u16,
}

impl HardwareInfo {
    /// Firmware version string, e.g. `0.17`
    #[must_use]
    pub fn firmware_version(&self) -> String {
        format!("0.{:02X}", self.sw_version & 0xFF)
    }

    /// Extended streaming mode is active
    #[must_use]
    pub const fn extended_mode(&self) -> bool {
        self.hw_status & (1 << 0) != 0
    }

    /// Stretch sensor detected
    #[must_use]
    pub const fn stretch_sensor(&self) -> bool {
        self.hw_status & (1 << 1) != 0
    }

    /// Calibration present
    #[must_use]
    pub const fn calibrated(&self) -> bool {
        self.hw_status & (1 << 2) != 0
    }

    /// IMU detected
    #[must_use]
    pub const fn imu_present(&self) -> bool {
        self.hw_status & (1 << 4) != 0
    }

    /// Altitude (pressure) sensor detected
    #[must_use]
    pub const fn altitude_sensor(&self) -> bool {
        self.hw_status & (1 << 5) != 0
    }

    /// Stored activities are available for download
    #[must_use]
    pub const fn activities_available(&self) -> bool {
        self.hw_status & (1 << 6) != 0
    }
}

/// Events pushed to the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WearableEvent {
    /// A sensor was seen for the first time during the current scan
    DeviceDiscovered(DiscoveredDevice),
    /// A session was established
    Connected {
        /// Address of the connected sensor
        address: DeviceAddress,
    },
    /// The session ended, by request or link loss
    Disconnected {
        /// Address of the sensor
        address: DeviceAddress,
    },
    /// Unsolicited battery charge push
    BatteryStatus(BatteryStatus),
    /// Standard Battery Level characteristic value (percent)
    BatteryLevel(u8),
    /// One decoded data stream record
    Telemetry(TelemetryRecord),
    /// A file download finished (quiet window elapsed)
    DownloadComplete(DownloadSummary),
}

/// Connection parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Delay between resolving the device and service discovery, in milliseconds
    pub settle_delay_ms: u64,
    /// Service discovery attempts before giving up
    pub service_discovery_attempts: u32,
    /// Delay between service discovery attempts, in milliseconds
    pub service_discovery_backoff_ms: u64,
    /// Delay before retrying a failed notify enable, in milliseconds
    pub notify_retry_delay_ms: u64,
    /// Subscribe to the standard Battery Level characteristic after connecting
    pub subscribe_battery: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            settle_delay_ms: 200,
            service_discovery_attempts: 3,
            service_discovery_backoff_ms: 200,
            notify_retry_delay_ms: 100,
            subscribe_battery: true,
        }
    }
}

/// Protocol timing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Command response timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Download silence that marks the end of a transfer, in milliseconds
    pub download_quiet_window_ms: u64,
    /// Scan watchdog check period in milliseconds
    pub scan_watchdog_interval_ms: u64,
    /// Advertisement silence after which the scan is restarted, in milliseconds
    pub scan_silence_threshold_ms: u64,
}

impl TimeoutConfig {
    /// Command response timeout
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Download quiet window
    #[must_use]
    pub const fn download_quiet_window(&self) -> Duration {
        Duration::from_millis(self.download_quiet_window_ms)
    }

    /// Scan watchdog period
    #[must_use]
    pub const fn scan_watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.scan_watchdog_interval_ms)
    }

    /// Scan silence threshold
    #[must_use]
    pub const fn scan_silence_threshold(&self) -> Duration {
        Duration::from_millis(self.scan_silence_threshold_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 10_000,
            download_quiet_window_ms: 1_000,
            scan_watchdog_interval_ms: 5_000,
            scan_silence_threshold_ms: 8_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_address_formatting() {
        let address = DeviceAddress(0x00A1_B2C3_D4E5);
        assert_eq!(address.to_string(), "00A1B2C3D4E5");
        assert_eq!(address.display_name(), "TYME-D4E5");
        assert_eq!(address.to_bytes(), [0x00, 0xA1, 0xB2, 0xC3, 0xD4, 0xE5]);
        assert_eq!(DeviceAddress::from_bytes(address.to_bytes()), address);
    }

    #[test]
    fn test_display_name_pads_short_addresses() {
        assert_eq!(DeviceAddress(0x0A).display_name(), "TYME-000A");
    }

    #[test]
    fn test_file_entry() {
        let entry = FileEntry {
            timestamp: 1_700_000_000,
            start_addr: 100,
            end_addr: 356,
        };
        assert_eq!(entry.size(), 256);
        assert_eq!(entry.file_name(), "file_1700000000.txt");
        assert_eq!(entry.to_string(), "1700000000 (256 bytes)");
    }

    #[test]
    fn test_connection_params_default() {
        let params = ConnectionParams::default();
        assert_eq!(params.settle_delay_ms, 200);
        assert_eq!(params.service_discovery_attempts, 3);
        assert_eq!(params.service_discovery_backoff_ms, 200);
        assert_eq!(params.notify_retry_delay_ms, 100);
        assert!(params.subscribe_battery);
    }

    #[test]
    fn test_timeout_config_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.download_quiet_window(), Duration::from_millis(1_000));
        assert_eq!(config.scan_watchdog_interval(), Duration::from_secs(5));
        assert_eq!(config.scan_silence_threshold(), Duration::from_secs(8));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::SettingUpCharacteristics.to_string(),
            "Setting Up Characteristics"
        );
    }
}
