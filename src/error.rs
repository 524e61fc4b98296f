use thiserror::Error;
use uuid::Uuid;

use crate::protocol::Opcode;

/// Errors that can occur when working with Tyme Wear sensors
#[derive(Error, Debug)]
pub enum TymewearError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found by the transport
    #[error("Tyme Wear device not found")]
    DeviceNotFound,

    /// Session establishment failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Control command failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Transport reported a failure that is not a btleplug error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// A file download is already open on this session
    #[error("A file download is already in progress")]
    DownloadInProgress,

    /// Message parsing failed
    #[error("Failed to parse message: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Tyme Wear operations
pub type Result<T> = std::result::Result<T, TymewearError>;

impl TymewearError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::DeviceNotFound
                | Self::Connection(_)
                | Self::Command(CommandError::NotConnected)
        )
    }

    /// Check if this error is recoverable by retrying the same operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Command(CommandError::Timeout { .. } | CommandError::Rejected { .. })
                | Self::Connection(ConnectionError::ServiceNotFound { .. })
        )
    }
}

/// Failures while establishing a device session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The custom service did not show up after every discovery attempt
    #[error("Tyme Wear service not found after {attempts} attempt(s)")]
    ServiceNotFound {
        /// Number of discovery attempts made
        attempts: u32,
    },

    /// A required characteristic is missing from the service
    #[error("Characteristic {uuid} not found")]
    CharacteristicNotFound {
        /// UUID of the missing characteristic
        uuid: Uuid,
    },

    /// Notifications could not be enabled on a characteristic
    #[error("Failed to enable notifications on {uuid}")]
    NotifyEnableFailed {
        /// UUID of the characteristic
        uuid: Uuid,
    },
}

/// Failures of a single control command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// No session is active, or it was torn down while the command was pending
    #[error("Device not connected")]
    NotConnected,

    /// No response carrying the command's tag arrived in time
    #[error("Command {opcode} (tag {tag}) timed out after {timeout_ms}ms")]
    Timeout {
        /// Opcode of the command
        opcode: Opcode,
        /// Tag the command was sent with
        tag: u16,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The device answered with a non-success response code
    #[error("Command {opcode} rejected with response code 0x{code:04X}")]
    Rejected {
        /// Opcode of the command
        opcode: Opcode,
        /// Raw response code
        code: u16,
    },
}

/// Telemetry decode failures; logged and counted, never surfaced to callers
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Notification carried no bytes at all
    #[error("Empty notification")]
    Empty,

    /// Notification shorter than its declared record type requires
    #[error("Record type {record_type} too short: {actual} bytes, expected {expected}")]
    TooShort {
        /// Leading type byte
        record_type: u8,
        /// Minimum length for this type
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// Leading type byte is not a known record type
    #[error("Unknown record type 0x{0:02X}")]
    UnknownType(u8),
}

/// Unexpected record type in the download stream; the buffer was discarded
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Download stream desync on type 0x{record_type:02X}, discarded {discarded} byte(s)")]
pub struct DownloadDesyncError {
    /// The unrecognized type byte
    pub record_type: u8,
    /// Number of buffered bytes that were thrown away
    pub discarded: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let not_found: TymewearError = ConnectionError::ServiceNotFound { attempts: 3 }.into();
        assert!(not_found.is_connection_error());
        assert!(not_found.is_recoverable());

        let timeout: TymewearError = CommandError::Timeout {
            opcode: Opcode::ListFiles,
            tag: 7,
            timeout_ms: 10_000,
        }
        .into();
        assert!(!timeout.is_connection_error());
        assert!(timeout.is_recoverable());

        let not_connected: TymewearError = CommandError::NotConnected.into();
        assert!(not_connected.is_connection_error());
        assert!(!not_connected.is_recoverable());

        assert!(!TymewearError::Cancelled.is_connection_error());
        assert!(!TymewearError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let rejected = CommandError::Rejected {
            opcode: Opcode::EraseFiles,
            code: 0x8500,
        };
        let text = rejected.to_string();
        assert!(text.contains("ERASE_FILES"));
        assert!(text.contains("0x8500"));

        let timeout = CommandError::Timeout {
            opcode: Opcode::GetInfo,
            tag: 42,
            timeout_ms: 10_000,
        };
        assert_eq!(
            timeout.to_string(),
            "Command GET_INFO (tag 42) timed out after 10000ms"
        );

        let desync = DownloadDesyncError {
            record_type: 0x09,
            discarded: 5,
        };
        assert!(desync.to_string().contains("0x09"));
    }
}
