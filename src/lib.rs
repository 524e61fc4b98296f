#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Tymewear
//!
//! A Rust protocol engine for Tyme Wear breathing, motion and stretch sensors
//! over Bluetooth Low Energy.
//!
//! The sensor exposes one proprietary GATT service with three characteristics:
//!
//! - **Control** (write + notify): tagged request/response commands, plus an
//!   unsolicited battery charge push
//! - **Data stream** (notify): one live telemetry record per notification,
//!   in seven fixed layouts
//! - **Download** (notify): a concatenated record stream while a stored
//!   recording is being transferred
//!
//! The library correlates commands with their responses by tag, decodes the
//! telemetry records, reassembles downloads and detects their end with a
//! quiet window, and keeps advertisement scans alive with a watchdog. Everything
//! the application needs to react to arrives as a [`WearableEvent`].
//!
//! ## Transport
//!
//! All Bluetooth access goes through the [`BleTransport`] trait.
//! [`BtleplugTransport`] talks to real hardware through btleplug;
//! [`MockTransport`] is a scriptable in-memory peripheral for tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::{fs::File, sync::Arc, time::Duration};
//! use tymewear::{BtleplugTransport, TymewearDevice};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleplugTransport::new().await?);
//!     let (device, _events) = TymewearDevice::new(transport);
//!
//!     // Find the closest sensor and connect
//!     let found = device.scan_for(Duration::from_secs(5)).await?;
//!     let sensor = found.first().ok_or("no sensor found")?;
//!     device.connect(sensor.address).await?;
//!
//!     // Download every stored recording
//!     for entry in device.list_files().await? {
//!         let out = File::create(format!("{}.txt", entry.timestamp))?;
//!         let summary = device.download_file(&entry, out).await?;
//!         println!("{}: {} records", entry, summary.records());
//!     }
//!
//!     device.disconnect().await?;
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Battery status tracking
pub mod battery;
/// btleplug transport
pub mod ble;
/// Control command channel
pub mod command;
/// Main device interface
pub mod device;
/// Per-session counters
pub mod diagnostics;
/// Download reassembly
pub mod download;
/// Error types and handling
pub mod error;
/// In-memory transport
pub mod mock;
/// Control envelope and payload parsing
pub mod protocol;
/// Advertisement scanning
pub mod scanner;
/// Per-connection state
pub mod session;
/// Data stream decoding
pub mod telemetry;
/// Transport abstraction
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use battery::BatteryStatus;
pub use ble::BtleplugTransport;
pub use device::TymewearDevice;
pub use diagnostics::DiagnosticsSnapshot;
pub use download::{DownloadRecord, DownloadSummary};
pub use error::{
    CommandError, ConnectionError, DecodeError, DownloadDesyncError, Result, TymewearError,
};
pub use mock::MockTransport;
pub use protocol::{ControlResponse, Opcode, ResponseCode};
pub use scanner::{ScanWatchdog, Scanner};
pub use telemetry::TelemetryRecord;
pub use transport::BleTransport;
pub use types::{
    ConnectionParams, ConnectionState, DeviceAddress, DiscoveredDevice, FileEntry, HardwareInfo,
    TimeoutConfig, WearableEvent,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tyme Wear proprietary service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x40B5_0000_30B5_11E5_A151_FEFF_819C_DC90);

/// Control characteristic: command writes and response notifications
pub const CONTROL_CHAR_UUID: Uuid = Uuid::from_u128(0x40B5_0007_30B5_11E5_A151_FEFF_819C_DC90);

/// Data stream characteristic: live telemetry notifications
pub const DATA_STREAM_CHAR_UUID: Uuid =
    Uuid::from_u128(0x40B5_0004_30B5_11E5_A151_FEFF_819C_DC90);

/// Download characteristic: stored recording transfer
pub const DOWNLOAD_CHAR_UUID: Uuid = Uuid::from_u128(0x40B5_0001_30B5_11E5_A151_FEFF_819C_DC90);

/// Standard Battery Service (0x180F)
pub const BATTERY_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180F_0000_1000_8000_0080_5F9B_34FB);

/// Standard Battery Level characteristic (0x2A19)
pub const BATTERY_LEVEL_CHAR_UUID: Uuid =
    Uuid::from_u128(0x0000_2A19_0000_1000_8000_0080_5F9B_34FB);
