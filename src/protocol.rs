use crate::{
    error::{Result, TymewearError},
    types::{FileEntry, HardwareInfo},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the `opcode:u16, tag:u16` command header
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Size of the `code:u16, tag:u16` response header
pub const RESPONSE_HEADER_SIZE: usize = 4;

/// Size of one packed file list entry
pub const FILE_ENTRY_SIZE: usize = 12;

/// Size of the packed GET_INFO payload
pub const HARDWARE_INFO_SIZE: usize = 22;

/// Response code of the unsolicited battery charge push on the control characteristic
pub const BATTERY_STATUS_CODE: u16 = 0x4002;

/// Response code reported for a successfully executed command
pub const SUCCESS_CODE: u16 = 0x8000;

/// Control opcodes understood by the sensor firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Opcode {
    /// Read the hardware information block
    GetInfo = 0x0001,
    /// Start recording an activity
    StartActivity = 0x0020,
    /// Stop the current activity
    StopActivity = 0x0021,
    /// Erase every stored file
    EraseFiles = 0x002B,
    /// Set the device clock (param: Unix seconds)
    SyncRtc = 0x002C,
    /// Start the raw stretch stream
    StartStretch = 0x002D,
    /// Stop the raw stretch stream
    StopStretch = 0x002E,
    /// Stream a stored file over the download characteristic (param: file timestamp)
    DataDump = 0x0108,
    /// List stored files
    ListFiles = 0x0109,
    /// Run the factory calibration routine
    FactoryCalibration = 0x010A,
}

impl Opcode {
    /// Convert from the raw wire value
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::GetInfo),
            0x0020 => Some(Self::StartActivity),
            0x0021 => Some(Self::StopActivity),
            0x002B => Some(Self::EraseFiles),
            0x002C => Some(Self::SyncRtc),
            0x002D => Some(Self::StartStretch),
            0x002E => Some(Self::StopStretch),
            0x0108 => Some(Self::DataDump),
            0x0109 => Some(Self::ListFiles),
            0x010A => Some(Self::FactoryCalibration),
            _ => None,
        }
    }

    /// Raw wire value
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    /// Firmware name used in diagnostic logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetInfo => "GET_INFO",
            Self::StartActivity => "START_ACTIVITY",
            Self::StopActivity => "STOP_ACTIVITY",
            Self::EraseFiles => "ERASE_FILES",
            Self::SyncRtc => "SYNC_RTC",
            Self::StartStretch => "START_STRETCH",
            Self::StopStretch => "STOP_STRETCH",
            Self::DataDump => "DATA_DUMP",
            Self::ListFiles => "LIST_FILES",
            Self::FactoryCalibration => "FACTORY_CALIBRATION",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response and status codes sent back on the control characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ResponseCode {
    /// Command executed
    Success = 0x8000,
    /// Malformed request
    InvalidRequest = 0x8100,
    /// Parameter out of range
    InvalidParam = 0x8200,
    /// Requested item does not exist
    NotFound = 0x8300,
    /// Generic firmware failure
    Error = 0x8400,
    /// Device is busy with another operation
    Busy = 0x8500,
    /// Operation locked in the current mode
    Locked = 0x8600,
    /// Operation not permitted
    Forbidden = 0x8700,
    /// Out of memory
    NoMemory = 0x8800,
    /// Streaming status: storage full
    StatusNoMemory = 0x4000,
    /// Streaming status: sensor fitting in progress
    StatusFitting = 0x4001,
    /// Unsolicited battery charge push
    BatteryStatus = 0x4002,
}

impl ResponseCode {
    /// Convert from the raw wire value
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x8000 => Some(Self::Success),
            0x8100 => Some(Self::InvalidRequest),
            0x8200 => Some(Self::InvalidParam),
            0x8300 => Some(Self::NotFound),
            0x8400 => Some(Self::Error),
            0x8500 => Some(Self::Busy),
            0x8600 => Some(Self::Locked),
            0x8700 => Some(Self::Forbidden),
            0x8800 => Some(Self::NoMemory),
            0x4000 => Some(Self::StatusNoMemory),
            0x4001 => Some(Self::StatusFitting),
            0x4002 => Some(Self::BatteryStatus),
            _ => None,
        }
    }

    /// Firmware name used in diagnostic logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::InvalidRequest => "INVALID_REQ",
            Self::InvalidParam => "INVALID_PARAM",
            Self::NotFound => "NOT_FOUND",
            Self::Error => "ERROR",
            Self::Busy => "BUSY",
            Self::Locked => "LOCKED",
            Self::Forbidden => "FORBIDDEN",
            Self::NoMemory => "NO_MEM",
            Self::StatusNoMemory => "STAT_NO_MEM",
            Self::StatusFitting => "STAT_FITTING",
            Self::BatteryStatus => "STAT_BATTERY",
        }
    }
}

/// Human readable name of a raw response code, `UNKNOWN` when not in the table
#[must_use]
pub const fn response_name(code: u16) -> &'static str {
    match ResponseCode::from_u16(code) {
        Some(known) => known.name(),
        None => "UNKNOWN",
    }
}

/// Outbound control envelope
///
/// Wire layout (little-endian):
/// - Bytes 0-1: opcode
/// - Bytes 2-3: tag
/// - Bytes 4-7: optional parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandEnvelope {
    /// Command opcode
    pub opcode: Opcode,
    /// Correlation tag echoed by the response
    pub tag: u16,
    /// Optional 32-bit parameter
    pub param: Option<u32>,
}

impl CommandEnvelope {
    /// Create a new envelope
    #[must_use]
    pub const fn new(opcode: Opcode, tag: u16, param: Option<u32>) -> Self {
        Self { opcode, tag, param }
    }

    /// Serialize the envelope to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_SIZE + 4);
        buf.put_u16_le(self.opcode.code());
        buf.put_u16_le(self.tag);
        if let Some(param) = self.param {
            buf.put_u32_le(param);
        }
        buf.freeze()
    }
}

/// Inbound control envelope: a command response or an unsolicited status push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    /// Raw response or status code
    pub code: u16,
    /// Echoed tag, or a status counter for unsolicited pushes
    pub tag: u16,
    /// Bytes following the header
    pub payload: Bytes,
}

impl ControlResponse {
    /// Parse a control notification
    ///
    /// # Errors
    ///
    /// Returns [`TymewearError::Parse`] if the notification is shorter than the header.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < RESPONSE_HEADER_SIZE {
            return Err(TymewearError::Parse(format!(
                "Control message too short: {} bytes, expected at least {}",
                data.len(),
                RESPONSE_HEADER_SIZE
            )));
        }

        let mut buf = data;
        let code = buf.get_u16_le();
        let tag = buf.get_u16_le();

        Ok(Self {
            code,
            tag,
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Known response code, if any
    #[must_use]
    pub const fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_u16(self.code)
    }

    /// Whether the device reported success
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Whether this is the unsolicited battery push rather than a command response
    #[must_use]
    pub const fn is_battery_status(&self) -> bool {
        self.code == BATTERY_STATUS_CODE
    }

    /// Human readable response name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        response_name(self.code)
    }
}

/// Raw charge counter carried by a battery status push
#[must_use]
pub fn parse_battery_charge(payload: &[u8]) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    let mut buf = payload;
    Some(buf.get_u32_le())
}

/// Parse a LIST_FILES payload into file entries
///
/// Each entry is 12 packed bytes: timestamp, start address, end address.
/// A trailing partial entry is ignored.
#[must_use]
pub fn parse_file_list(payload: &[u8]) -> Vec<FileEntry> {
    payload
        .chunks_exact(FILE_ENTRY_SIZE)
        .map(|mut chunk| FileEntry {
            timestamp: chunk.get_u32_le(),
            start_addr: chunk.get_u32_le(),
            end_addr: chunk.get_u32_le(),
        })
        .collect()
}

/// Parse a GET_INFO payload
///
/// Packed layout (little-endian):
/// - Bytes 0-1: software version
/// - Byte 2: hardware version
/// - Bytes 3-4: IMU period (ms)
/// - Bytes 5-6: data point period (ms)
/// - Byte 7: hardware status flags
/// - Bytes 8-9: base calibration
/// - Bytes 10-11: user tidal volume calibration
/// - Bytes 12-15: device RTC (Unix seconds)
/// - Bytes 16-19: activity start (Unix seconds)
/// - Bytes 20-21: activity threshold
///
/// # Errors
///
/// Returns [`TymewearError::Parse`] if the payload is shorter than [`HARDWARE_INFO_SIZE`].
pub fn parse_hardware_info(payload: &[u8]) -> Result<HardwareInfo> {
    if payload.len() < HARDWARE_INFO_SIZE {
        return Err(TymewearError::Parse(format!(
            "Hardware info too short: {} bytes, expected {}",
            payload.len(),
            HARDWARE_INFO_SIZE
        )));
    }

    let mut buf = payload;
    Ok(HardwareInfo {
        sw_version: buf.get_u16_le(),
        hw_version: buf.get_u8(),
        imu_period_ms: buf.get_u16_le(),
        data_point_period_ms: buf.get_u16_le(),
        hw_status: buf.get_u8(),
        base_calibration: buf.get_u16_le(),
        user_vt_calibration: buf.get_u16_le(),
        current_rtc: buf.get_u32_le(),
        activity_start: buf.get_u32_le(),
        activity_threshold: buf.get_u16_le(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_without_param() {
        let bytes = CommandEnvelope::new(Opcode::ListFiles, 1, None).to_bytes();
        assert_eq!(&bytes[..], &[0x09, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_envelope_with_param() {
        let bytes = CommandEnvelope::new(Opcode::DataDump, 0x1234, Some(0x6553_F100)).to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..2], &0x0108u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &0x1234u16.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x6553_F100u32.to_le_bytes());
    }

    #[test]
    fn test_response_parsing() {
        let data = [0x00, 0x80, 0x05, 0x00, 0xAA, 0xBB];
        let response = ControlResponse::from_bytes(&data).unwrap();

        assert_eq!(response.code, SUCCESS_CODE);
        assert_eq!(response.tag, 5);
        assert_eq!(&response.payload[..], &[0xAA, 0xBB]);
        assert!(response.is_success());
        assert!(!response.is_battery_status());
        assert_eq!(response.response_code(), Some(ResponseCode::Success));
    }

    #[test]
    fn test_response_too_short() {
        assert!(ControlResponse::from_bytes(&[0x00, 0x80, 0x01]).is_err());
    }

    #[test]
    fn test_battery_push_detection() {
        let mut data = vec![0x02, 0x40, 0x07, 0x00];
        data.extend_from_slice(&1234u32.to_le_bytes());
        let response = ControlResponse::from_bytes(&data).unwrap();

        assert!(response.is_battery_status());
        assert_eq!(parse_battery_charge(&response.payload), Some(1234));
        assert_eq!(parse_battery_charge(&[0x01, 0x02]), None);
    }

    #[test]
    fn test_name_tables() {
        assert_eq!(response_name(0x8500), "BUSY");
        assert_eq!(response_name(0x4001), "STAT_FITTING");
        assert_eq!(response_name(0x1234), "UNKNOWN");
        assert_eq!(
            Opcode::from_u16(0x010A).map(Opcode::name),
            Some("FACTORY_CALIBRATION")
        );
        assert_eq!(Opcode::from_u16(0x7777), None);
        assert_eq!(Opcode::from_u16(0x002C), Some(Opcode::SyncRtc));
        assert_eq!(Opcode::SyncRtc.to_string(), "SYNC_RTC");
    }

    #[test]
    fn test_file_list_parsing() {
        let mut payload = Vec::new();
        for (ts, start, end) in [(1_700_000_000u32, 0u32, 4096u32), (1_700_100_000, 4096, 10_000)] {
            payload.extend_from_slice(&ts.to_le_bytes());
            payload.extend_from_slice(&start.to_le_bytes());
            payload.extend_from_slice(&end.to_le_bytes());
        }
        payload.extend_from_slice(&[0xFF, 0xFF, 0xFF]);

        let files = parse_file_list(&payload);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].timestamp, 1_700_000_000);
        assert_eq!(files[0].size(), 4096);
        assert_eq!(files[1].start_addr, 4096);
        assert_eq!(files[1].size(), 5904);
    }

    #[test]
    fn test_hardware_info_parsing() {
        let mut payload = BytesMut::new();
        payload.put_u16_le(0x0017);
        payload.put_u8(3);
        payload.put_u16_le(20);
        payload.put_u16_le(1000);
        payload.put_u8(0b0101_0011);
        payload.put_u16_le(512);
        payload.put_u16_le(600);
        payload.put_u32_le(1_700_000_000);
        payload.put_u32_le(1_699_990_000);
        payload.put_u16_le(42);

        let info = parse_hardware_info(&payload).unwrap();
        assert_eq!(info.sw_version, 0x0017);
        assert_eq!(info.hw_version, 3);
        assert_eq!(info.imu_period_ms, 20);
        assert_eq!(info.data_point_period_ms, 1000);
        assert!(info.extended_mode());
        assert!(info.stretch_sensor());
        assert!(!info.calibrated());
        assert!(info.imu_present());
        assert!(!info.altitude_sensor());
        assert!(info.activities_available());
        assert_eq!(info.current_rtc, 1_700_000_000);
        assert_eq!(info.activity_threshold, 42);
        assert_eq!(info.firmware_version(), "0.17");

        assert!(parse_hardware_info(&payload[..10]).is_err());
    }
}
