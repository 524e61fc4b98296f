//! Data stream decoding.
//!
//! Every notification on the data stream characteristic carries exactly one
//! record, identified by its leading type byte. All fields are little-endian.

use bytes::Buf;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Number of IMU samples and player load values in an extended record
pub const EXTENDED_SAMPLE_COUNT: usize = 5;

/// Record kinds on the data stream characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TelemetryKind {
    /// Raw chest stretch, five IMU samples, player load, pressure and temperature
    Extended = 0,
    /// Processed breathing rate, tidal volume and minute ventilation
    Breathing = 1,
    /// Processed IMU metrics
    ImuProcessed = 2,
    /// Raw stretch value
    Stretch = 3,
    /// Barometric pressure and temperature
    PressureTemp = 4,
    /// Heart rate
    HeartRate = 5,
    /// Tidal volume valley/peak markers
    BreathTimestamps = 6,
}

impl TelemetryKind {
    /// Convert from the leading type byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Extended),
            1 => Some(Self::Breathing),
            2 => Some(Self::ImuProcessed),
            3 => Some(Self::Stretch),
            4 => Some(Self::PressureTemp),
            5 => Some(Self::HeartRate),
            6 => Some(Self::BreathTimestamps),
            _ => None,
        }
    }

    /// Minimum notification length, type byte included
    #[must_use]
    pub const fn min_len(self) -> usize {
        match self {
            Self::Extended => 85,
            Self::Breathing | Self::BreathTimestamps => 17,
            Self::ImuProcessed => 13,
            Self::Stretch | Self::HeartRate => 7,
            Self::PressureTemp => 11,
        }
    }
}

/// One raw IMU sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImuSample {
    /// Accelerometer X
    pub acc_x: i16,
    /// Accelerometer Y
    pub acc_y: i16,
    /// Accelerometer Z
    pub acc_z: i16,
    /// Gyroscope X
    pub gyr_x: i16,
    /// Gyroscope Y
    pub gyr_y: i16,
    /// Gyroscope Z
    pub gyr_z: i16,
}

impl ImuSample {
    fn read(buf: &mut impl Buf) -> Self {
        Self {
            acc_x: buf.get_i16_le(),
            acc_y: buf.get_i16_le(),
            acc_z: buf.get_i16_le(),
            gyr_x: buf.get_i16_le(),
            gyr_y: buf.get_i16_le(),
            gyr_z: buf.get_i16_le(),
        }
    }
}

/// Extended mode data point (type 0)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedRecord {
    /// Relative sample counter
    pub counter: u32,
    /// Raw chest stretch
    pub chest_raw: u16,
    /// Normalized chest stretch
    pub chest_normalized: u16,
    /// IMU samples, oldest first
    pub imu: [ImuSample; EXTENDED_SAMPLE_COUNT],
    /// Player load per IMU sample
    pub player_load: [u16; EXTENDED_SAMPLE_COUNT],
    /// Barometric pressure
    pub pressure: u32,
    /// Temperature
    pub temperature: i16,
}

/// Processed breathing metrics (type 1)
///
/// Breathing rates travel as tenths of a breath per minute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BreathingRecord {
    /// Sample counter
    pub counter: u32,
    /// Raw breathing rate (breaths/min)
    pub raw_breath_rate: f32,
    /// Processed breathing rate (breaths/min)
    pub processed_breath_rate: f32,
    /// Raw tidal volume
    pub raw_tidal_volume: u16,
    /// Processed tidal volume
    pub processed_tidal_volume: u16,
    /// Raw minute ventilation
    pub raw_minute_ventilation: u16,
    /// Processed minute ventilation
    pub processed_minute_ventilation: u16,
}

impl BreathingRecord {
    /// Size of the record body, type byte excluded
    pub const BODY_LEN: usize = 16;

    pub(crate) fn read(buf: &mut impl Buf) -> Self {
        Self {
            counter: buf.get_u32_le(),
            raw_breath_rate: f32::from(buf.get_u16_le()) / 10.0,
            processed_breath_rate: f32::from(buf.get_u16_le()) / 10.0,
            raw_tidal_volume: buf.get_u16_le(),
            processed_tidal_volume: buf.get_u16_le(),
            raw_minute_ventilation: buf.get_u16_le(),
            processed_minute_ventilation: buf.get_u16_le(),
        }
    }
}

/// Processed IMU metrics (type 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImuProcessedRecord {
    /// Sample counter
    pub counter: u32,
    /// Cadence (steps/min)
    pub cadence: u16,
    /// Step time
    pub step_time: u32,
    /// Accumulated player load
    pub player_load: u16,
}

impl ImuProcessedRecord {
    /// Size of the record body, type byte excluded
    pub const BODY_LEN: usize = 12;

    pub(crate) fn read(buf: &mut impl Buf) -> Self {
        Self {
            counter: buf.get_u32_le(),
            cadence: buf.get_u16_le(),
            step_time: buf.get_u32_le(),
            player_load: buf.get_u16_le(),
        }
    }
}

/// Raw stretch value (type 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StretchRecord {
    /// Sample counter
    pub counter: u32,
    /// Stretch value
    pub value: u16,
}

/// Pressure and temperature (type 4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressureTempRecord {
    /// Sample counter
    pub counter: u32,
    /// Barometric pressure
    pub pressure: u32,
    /// Temperature
    pub temperature: i16,
}

/// Heart rate (type 5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateRecord {
    /// Device timestamp
    pub timestamp: u32,
    /// Heart rate (beats/min)
    pub heart_rate: u16,
}

impl HeartRateRecord {
    /// Size of the record body, type byte excluded
    pub const BODY_LEN: usize = 6;

    pub(crate) fn read(buf: &mut impl Buf) -> Self {
        Self {
            timestamp: buf.get_u32_le(),
            heart_rate: buf.get_u16_le(),
        }
    }
}

/// Tidal volume valley and peak markers (type 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreathTimestampsRecord {
    /// Sample counter
    pub counter: u32,
    /// Sample index of the last valley
    pub valley_time_index: u32,
    /// Tidal volume at the valley
    pub valley_value: u16,
    /// Sample index of the last peak
    pub peak_time_index: u32,
    /// Tidal volume at the peak
    pub peak_value: u16,
}

/// One decoded data stream notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TelemetryRecord {
    /// Type 0
    Extended(ExtendedRecord),
    /// Type 1
    Breathing(BreathingRecord),
    /// Type 2
    ImuProcessed(ImuProcessedRecord),
    /// Type 3
    Stretch(StretchRecord),
    /// Type 4
    PressureTemp(PressureTempRecord),
    /// Type 5
    HeartRate(HeartRateRecord),
    /// Type 6
    BreathTimestamps(BreathTimestampsRecord),
}

impl TelemetryRecord {
    /// Kind of this record
    #[must_use]
    pub const fn kind(&self) -> TelemetryKind {
        match self {
            Self::Extended(_) => TelemetryKind::Extended,
            Self::Breathing(_) => TelemetryKind::Breathing,
            Self::ImuProcessed(_) => TelemetryKind::ImuProcessed,
            Self::Stretch(_) => TelemetryKind::Stretch,
            Self::PressureTemp(_) => TelemetryKind::PressureTemp,
            Self::HeartRate(_) => TelemetryKind::HeartRate,
            Self::BreathTimestamps(_) => TelemetryKind::BreathTimestamps,
        }
    }
}

/// Decode one data stream notification
///
/// Bytes beyond the minimum length of the declared type are ignored.
///
/// # Errors
///
/// - [`DecodeError::Empty`] for a zero-length notification
/// - [`DecodeError::UnknownType`] for an unrecognized leading byte
/// - [`DecodeError::TooShort`] when the notification is shorter than its type requires
pub fn decode(data: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    let Some((&type_byte, mut body)) = data.split_first() else {
        return Err(DecodeError::Empty);
    };

    let kind = TelemetryKind::from_u8(type_byte).ok_or(DecodeError::UnknownType(type_byte))?;
    if data.len() < kind.min_len() {
        return Err(DecodeError::TooShort {
            record_type: type_byte,
            expected: kind.min_len(),
            actual: data.len(),
        });
    }

    let buf = &mut body;
    let record = match kind {
        TelemetryKind::Extended => {
            let counter = buf.get_u32_le();
            let chest_raw = buf.get_u16_le();
            let chest_normalized = buf.get_u16_le();
            let imu = std::array::from_fn(|_| ImuSample::read(buf));
            let player_load = std::array::from_fn(|_| buf.get_u16_le());
            TelemetryRecord::Extended(ExtendedRecord {
                counter,
                chest_raw,
                chest_normalized,
                imu,
                player_load,
                pressure: buf.get_u32_le(),
                temperature: buf.get_i16_le(),
            })
        }
        TelemetryKind::Breathing => TelemetryRecord::Breathing(BreathingRecord::read(buf)),
        TelemetryKind::ImuProcessed => {
            TelemetryRecord::ImuProcessed(ImuProcessedRecord::read(buf))
        }
        TelemetryKind::Stretch => TelemetryRecord::Stretch(StretchRecord {
            counter: buf.get_u32_le(),
            value: buf.get_u16_le(),
        }),
        TelemetryKind::PressureTemp => TelemetryRecord::PressureTemp(PressureTempRecord {
            counter: buf.get_u32_le(),
            pressure: buf.get_u32_le(),
            temperature: buf.get_i16_le(),
        }),
        TelemetryKind::HeartRate => TelemetryRecord::HeartRate(HeartRateRecord::read(buf)),
        TelemetryKind::BreathTimestamps => {
            TelemetryRecord::BreathTimestamps(BreathTimestampsRecord {
                counter: buf.get_u32_le(),
                valley_time_index: buf.get_u32_le(),
                valley_value: buf.get_u16_le(),
                peak_time_index: buf.get_u32_le(),
                peak_value: buf.get_u16_le(),
            })
        }
    };

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_breathing_record() {
        let mut data = BytesMut::new();
        data.put_u8(0x01);
        data.put_u32_le(100);
        for value in [150u16, 155, 300, 310, 5, 6] {
            data.put_u16_le(value);
        }

        let TelemetryRecord::Breathing(record) = decode(&data).unwrap() else {
            panic!("expected breathing record");
        };
        assert_eq!(record.counter, 100);
        assert!((record.raw_breath_rate - 15.0).abs() < f32::EPSILON);
        assert!((record.processed_breath_rate - 15.5).abs() < f32::EPSILON);
        assert_eq!(record.raw_tidal_volume, 300);
        assert_eq!(record.processed_tidal_volume, 310);
        assert_eq!(record.raw_minute_ventilation, 5);
        assert_eq!(record.processed_minute_ventilation, 6);
    }

    #[test]
    fn test_extended_record() {
        let mut data = BytesMut::new();
        data.put_u8(0x00);
        data.put_u32_le(7);
        data.put_u16_le(2048);
        data.put_u16_le(1024);
        for sample in 0..5i16 {
            for axis in 0..6i16 {
                data.put_i16_le(sample * 10 + axis - 30);
            }
        }
        for load in 0..5u16 {
            data.put_u16_le(load * 3);
        }
        data.put_u32_le(101_325);
        data.put_i16_le(-215);
        assert_eq!(data.len(), TelemetryKind::Extended.min_len());

        let TelemetryRecord::Extended(record) = decode(&data).unwrap() else {
            panic!("expected extended record");
        };
        assert_eq!(record.counter, 7);
        assert_eq!(record.chest_raw, 2048);
        assert_eq!(record.chest_normalized, 1024);
        assert_eq!(record.imu[0].acc_x, -30);
        assert_eq!(record.imu[0].gyr_z, -25);
        assert_eq!(record.imu[4].acc_x, 10);
        assert_eq!(record.imu[4].gyr_z, 15);
        assert_eq!(record.player_load, [0, 3, 6, 9, 12]);
        assert_eq!(record.pressure, 101_325);
        assert_eq!(record.temperature, -215);
    }

    #[test]
    fn test_imu_processed_record() {
        let mut data = BytesMut::new();
        data.put_u8(0x02);
        data.put_u32_le(11);
        data.put_u16_le(172);
        data.put_u32_le(348);
        data.put_u16_le(90);

        let record = decode(&data).unwrap();
        assert_eq!(
            record,
            TelemetryRecord::ImuProcessed(ImuProcessedRecord {
                counter: 11,
                cadence: 172,
                step_time: 348,
                player_load: 90,
            })
        );
        assert_eq!(record.kind(), TelemetryKind::ImuProcessed);
    }

    #[test]
    fn test_stretch_pressure_and_heart_rate_records() {
        let mut stretch = BytesMut::new();
        stretch.put_u8(0x03);
        stretch.put_u32_le(1);
        stretch.put_u16_le(777);
        assert_eq!(
            decode(&stretch).unwrap(),
            TelemetryRecord::Stretch(StretchRecord {
                counter: 1,
                value: 777
            })
        );

        let mut pressure = BytesMut::new();
        pressure.put_u8(0x04);
        pressure.put_u32_le(2);
        pressure.put_u32_le(99_000);
        pressure.put_i16_le(-5);
        assert_eq!(
            decode(&pressure).unwrap(),
            TelemetryRecord::PressureTemp(PressureTempRecord {
                counter: 2,
                pressure: 99_000,
                temperature: -5,
            })
        );

        let mut heart_rate = BytesMut::new();
        heart_rate.put_u8(0x05);
        heart_rate.put_u32_le(3_600);
        heart_rate.put_u16_le(64);
        assert_eq!(
            decode(&heart_rate).unwrap(),
            TelemetryRecord::HeartRate(HeartRateRecord {
                timestamp: 3_600,
                heart_rate: 64,
            })
        );
    }

    #[test]
    fn test_breath_timestamps_record() {
        let mut data = BytesMut::new();
        data.put_u8(0x06);
        data.put_u32_le(500);
        data.put_u32_le(480);
        data.put_u16_le(120);
        data.put_u32_le(495);
        data.put_u16_le(860);

        assert_eq!(
            decode(&data).unwrap(),
            TelemetryRecord::BreathTimestamps(BreathTimestampsRecord {
                counter: 500,
                valley_time_index: 480,
                valley_value: 120,
                peak_time_index: 495,
                peak_value: 860,
            })
        );
    }

    #[test]
    fn test_short_notifications_are_rejected() {
        let minimums = [85usize, 17, 13, 7, 11, 7, 17];
        for (type_byte, min_len) in (0u8..).zip(minimums) {
            let mut data = vec![0u8; min_len - 1];
            data[0] = type_byte;
            assert_eq!(
                decode(&data),
                Err(DecodeError::TooShort {
                    record_type: type_byte,
                    expected: min_len,
                    actual: min_len - 1,
                }),
                "type {type_byte}"
            );
        }
    }

    #[test]
    fn test_unknown_type_and_empty() {
        assert_eq!(decode(&[0x07, 0, 0, 0]), Err(DecodeError::UnknownType(0x07)));
        assert_eq!(decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let data = [0x03, 1, 0, 0, 0, 2, 0, 0xEE, 0xEE];
        assert_eq!(
            decode(&data).unwrap(),
            TelemetryRecord::Stretch(StretchRecord {
                counter: 1,
                value: 2
            })
        );
    }
}
