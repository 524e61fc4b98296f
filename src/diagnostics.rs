use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::types::DeviceAddress;

/// Per-session protocol counters
///
/// Created when a session starts and shared with the command channel and the
/// decoders; flushed to the log when the session is torn down.
#[derive(Debug)]
pub struct SessionDiagnostics {
    address: DeviceAddress,
    control_notifications: AtomicU64,
    responses_matched: AtomicU64,
    responses_unmatched: AtomicU64,
    command_timeouts: AtomicU64,
    telemetry_decoded: AtomicU64,
    telemetry_dropped: AtomicU64,
    telemetry_unknown: AtomicU64,
    download_bytes: AtomicU64,
    download_records: AtomicU64,
    download_desyncs: AtomicU64,
    download_write_errors: AtomicU64,
    battery_pushes: AtomicU64,
}

/// Point-in-time copy of [`SessionDiagnostics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticsSnapshot {
    /// Notifications received on the control characteristic
    pub control_notifications: u64,
    /// Responses matched to a pending command
    pub responses_matched: u64,
    /// Responses whose tag had no pending command
    pub responses_unmatched: u64,
    /// Commands that timed out
    pub command_timeouts: u64,
    /// Data stream records decoded
    pub telemetry_decoded: u64,
    /// Data stream notifications dropped for being too short
    pub telemetry_dropped: u64,
    /// Data stream notifications with an unknown type byte
    pub telemetry_unknown: u64,
    /// Bytes received on the download characteristic
    pub download_bytes: u64,
    /// Download records decoded
    pub download_records: u64,
    /// Download buffer resets caused by an unknown type byte
    pub download_desyncs: u64,
    /// Failed writes to the download output stream
    pub download_write_errors: u64,
    /// Battery status pushes received
    pub battery_pushes: u64,
}

macro_rules! counters {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            #[doc = concat!("Increment `", stringify!($field), "`")]
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl SessionDiagnostics {
    /// Create zeroed counters for a session with `address`
    #[must_use]
    pub const fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            control_notifications: AtomicU64::new(0),
            responses_matched: AtomicU64::new(0),
            responses_unmatched: AtomicU64::new(0),
            command_timeouts: AtomicU64::new(0),
            telemetry_decoded: AtomicU64::new(0),
            telemetry_dropped: AtomicU64::new(0),
            telemetry_unknown: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
            download_records: AtomicU64::new(0),
            download_desyncs: AtomicU64::new(0),
            download_write_errors: AtomicU64::new(0),
            battery_pushes: AtomicU64::new(0),
        }
    }

    counters! {
        control_notification => control_notifications,
        response_matched => responses_matched,
        response_unmatched => responses_unmatched,
        command_timeout => command_timeouts,
        telemetry_decoded => telemetry_decoded,
        telemetry_dropped => telemetry_dropped,
        telemetry_unknown => telemetry_unknown,
        download_record => download_records,
        download_desync => download_desyncs,
        download_write_error => download_write_errors,
        battery_push => battery_pushes,
    }

    /// Add received download bytes
    pub fn download_bytes(&self, count: usize) {
        self.download_bytes
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Copy the current counter values
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            control_notifications: self.control_notifications.load(Ordering::Relaxed),
            responses_matched: self.responses_matched.load(Ordering::Relaxed),
            responses_unmatched: self.responses_unmatched.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            telemetry_decoded: self.telemetry_decoded.load(Ordering::Relaxed),
            telemetry_dropped: self.telemetry_dropped.load(Ordering::Relaxed),
            telemetry_unknown: self.telemetry_unknown.load(Ordering::Relaxed),
            download_bytes: self.download_bytes.load(Ordering::Relaxed),
            download_records: self.download_records.load(Ordering::Relaxed),
            download_desyncs: self.download_desyncs.load(Ordering::Relaxed),
            download_write_errors: self.download_write_errors.load(Ordering::Relaxed),
            battery_pushes: self.battery_pushes.load(Ordering::Relaxed),
        }
    }

    /// Log the final counters of the session and return them
    pub fn flush(&self) -> DiagnosticsSnapshot {
        let snapshot = self.snapshot();
        info!(
            address = %self.address,
            control = snapshot.control_notifications,
            matched = snapshot.responses_matched,
            unmatched = snapshot.responses_unmatched,
            timeouts = snapshot.command_timeouts,
            telemetry = snapshot.telemetry_decoded,
            dropped = snapshot.telemetry_dropped,
            unknown = snapshot.telemetry_unknown,
            download_bytes = snapshot.download_bytes,
            download_records = snapshot.download_records,
            desyncs = snapshot.download_desyncs,
            battery = snapshot.battery_pushes,
            "Session diagnostics"
        );
        snapshot
    }
}
