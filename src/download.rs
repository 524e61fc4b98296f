use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    diagnostics::SessionDiagnostics,
    error::{DownloadDesyncError, Result, TymewearError},
    telemetry::{BreathingRecord, HeartRateRecord, ImuProcessedRecord},
    types::WearableEvent,
};

/// Body length of a download record of `record_type`, type byte excluded
#[must_use]
pub const fn record_body_len(record_type: u8) -> Option<usize> {
    match record_type {
        1 => Some(BreathingRecord::BODY_LEN),
        2 => Some(ImuProcessedRecord::BODY_LEN),
        5 => Some(HeartRateRecord::BODY_LEN),
        _ => None,
    }
}

/// One record extracted from the download stream
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DownloadRecord {
    /// Type 1
    Breathing(BreathingRecord),
    /// Type 2
    Imu(ImuProcessedRecord),
    /// Type 5
    HeartRate(HeartRateRecord),
}

/// Byte queue holding download data until a whole record is available
///
/// After every [`drain`](Self::drain) the queue holds at most one incomplete
/// trailing record.
#[derive(Debug, Default)]
pub struct DownloadBuffer {
    bytes: BytesMut,
}

impl DownloadBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a notification
    pub fn extend(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Buffered byte count
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Drop everything buffered
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Pass every complete leading record to `emit`
    ///
    /// Returns the number of records emitted.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadDesyncError`] when the next record has an unknown type.
    /// The whole buffer is cleared in that case; records emitted before the
    /// bad byte stay emitted.
    pub fn drain(
        &mut self,
        mut emit: impl FnMut(DownloadRecord),
    ) -> std::result::Result<usize, DownloadDesyncError> {
        let mut emitted = 0;
        while let Some(&record_type) = self.bytes.first() {
            let Some(body_len) = record_body_len(record_type) else {
                let discarded = self.bytes.len();
                self.bytes.clear();
                return Err(DownloadDesyncError {
                    record_type,
                    discarded,
                });
            };
            if self.bytes.len() < 1 + body_len {
                break;
            }

            let mut record = self.bytes.split_to(1 + body_len);
            record.advance(1);
            let decoded = match record_type {
                1 => DownloadRecord::Breathing(BreathingRecord::read(&mut record)),
                2 => DownloadRecord::Imu(ImuProcessedRecord::read(&mut record)),
                _ => DownloadRecord::HeartRate(HeartRateRecord::read(&mut record)),
            };
            emit(decoded);
            emitted += 1;
        }
        Ok(emitted)
    }
}

/// Breath rate as sent by the sensor, in tenths of a breath per minute
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn wire_breath_rate(rate: f32) -> u16 {
    (rate * 10.0).round() as u16
}

/// Text output of a download
///
/// Each record kind gets a one-time `[Breathing]`, `[IMU]` or `[HR]` header
/// line the first time it appears, followed by one comma-separated row per
/// record. Fields are written as sent by the sensor, so breath rates are in
/// tenths.
pub struct DownloadWriter {
    out: Box<dyn Write + Send>,
    breathing_header: bool,
    imu_header: bool,
    heart_rate_header: bool,
}

impl DownloadWriter {
    /// Wrap an output sink
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            breathing_header: false,
            imu_header: false,
            heart_rate_header: false,
        }
    }

    /// Append one record
    ///
    /// # Errors
    ///
    /// Returns any error from the sink.
    pub fn write_record(&mut self, record: &DownloadRecord) -> io::Result<()> {
        match record {
            DownloadRecord::Breathing(r) => {
                if !self.breathing_header {
                    writeln!(self.out, "[Breathing]")?;
                    self.breathing_header = true;
                }
                writeln!(
                    self.out,
                    "{},{},{},{},{},{},{}",
                    r.counter,
                    wire_breath_rate(r.raw_breath_rate),
                    wire_breath_rate(r.processed_breath_rate),
                    r.raw_tidal_volume,
                    r.processed_tidal_volume,
                    r.raw_minute_ventilation,
                    r.processed_minute_ventilation
                )
            }
            DownloadRecord::Imu(r) => {
                if !self.imu_header {
                    writeln!(self.out, "[IMU]")?;
                    self.imu_header = true;
                }
                writeln!(
                    self.out,
                    "{},{},{},{}",
                    r.counter, r.cadence, r.step_time, r.player_load
                )
            }
            DownloadRecord::HeartRate(r) => {
                if !self.heart_rate_header {
                    writeln!(self.out, "[HR]")?;
                    self.heart_rate_header = true;
                }
                writeln!(self.out, "{},{}", r.timestamp, r.heart_rate)
            }
        }
    }

    /// Flush and close the sink
    ///
    /// # Errors
    ///
    /// Returns any error from the final flush.
    pub fn finish(mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Outcome of one file download
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSummary {
    /// Timestamp of the downloaded file
    pub file_timestamp: u32,
    /// Breathing records written
    pub breathing: u64,
    /// IMU records written
    pub imu: u64,
    /// Heart rate records written
    pub heart_rate: u64,
    /// Buffer resets caused by an unknown record type
    pub desyncs: u64,
    /// Raw bytes received on the download characteristic
    pub bytes_received: u64,
}

impl DownloadSummary {
    /// Total records written
    #[must_use]
    pub const fn records(&self) -> u64 {
        self.breathing + self.imu + self.heart_rate
    }
}

struct ActiveDownload {
    buffer: DownloadBuffer,
    writer: DownloadWriter,
    summary: DownloadSummary,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
    done: Option<oneshot::Sender<DownloadSummary>>,
}

#[derive(Default)]
struct ReassemblyState {
    active: Option<ActiveDownload>,
    epoch: u64,
}

/// Reassembles download notifications into records and detects the end of a transfer
///
/// The peripheral sends no terminator, so a transfer is considered complete
/// once no notification has arrived for the quiet window. The window is armed
/// when the download begins and re-armed on every notification.
pub struct DownloadReassembler {
    state: Mutex<ReassemblyState>,
    quiet_window: Duration,
    runtime: Handle,
    events: mpsc::UnboundedSender<WearableEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl DownloadReassembler {
    /// Create a reassembler whose timers run on `runtime`
    #[must_use]
    pub fn new(
        quiet_window: Duration,
        runtime: Handle,
        events: mpsc::UnboundedSender<WearableEvent>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Self {
        Self {
            state: Mutex::new(ReassemblyState::default()),
            quiet_window,
            runtime,
            events,
            diagnostics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReassemblyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a download of the file identified by `file_timestamp`
    ///
    /// The returned receiver yields the summary when the quiet window fires.
    ///
    /// # Errors
    ///
    /// Returns [`TymewearError::DownloadInProgress`] if a download is already open.
    pub fn begin(
        self: &Arc<Self>,
        file_timestamp: u32,
        writer: DownloadWriter,
    ) -> Result<oneshot::Receiver<DownloadSummary>> {
        let mut state = self.lock();
        if state.active.is_some() {
            return Err(TymewearError::DownloadInProgress);
        }

        state.epoch += 1;
        let epoch = state.epoch;
        let (done, completion) = oneshot::channel();
        state.active = Some(ActiveDownload {
            buffer: DownloadBuffer::new(),
            writer,
            summary: DownloadSummary {
                file_timestamp,
                ..DownloadSummary::default()
            },
            epoch,
            timer: Some(self.arm_timer(epoch)),
            done: Some(done),
        });
        info!("Downloading file [{}]", file_timestamp);
        Ok(completion)
    }

    /// Handle a notification from the download characteristic
    ///
    /// Notifications arriving while no download is open are ignored.
    pub fn on_notification(self: &Arc<Self>, data: &[u8]) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(active) = state.active.as_mut() else {
            trace!("Download notification outside a transfer ({} bytes)", data.len());
            return;
        };
        self.diagnostics.download_bytes(data.len());

        state.epoch += 1;
        active.epoch = state.epoch;
        if let Some(stale) = active.timer.replace(self.arm_timer(state.epoch)) {
            stale.abort();
        }

        active.summary.bytes_received += data.len() as u64;
        active.buffer.extend(data);

        let ActiveDownload {
            buffer,
            writer,
            summary,
            ..
        } = active;
        let diagnostics = &self.diagnostics;
        let drained = buffer.drain(|record| {
            match record {
                DownloadRecord::Breathing(_) => summary.breathing += 1,
                DownloadRecord::Imu(_) => summary.imu += 1,
                DownloadRecord::HeartRate(_) => summary.heart_rate += 1,
            }
            diagnostics.download_record();
            if let Err(e) = writer.write_record(&record) {
                diagnostics.download_write_error();
                warn!("Failed to write download record: {}", e);
            }
        });

        if let Err(desync) = drained {
            summary.desyncs += 1;
            diagnostics.download_desync();
            warn!("{}", desync);
        }
    }

    fn arm_timer(self: &Arc<Self>, epoch: u64) -> JoinHandle<()> {
        let reassembler = Arc::downgrade(self);
        let quiet_window = self.quiet_window;
        self.runtime.spawn(async move {
            tokio::time::sleep(quiet_window).await;
            if let Some(reassembler) = reassembler.upgrade() {
                reassembler.finish(epoch);
            }
        })
    }

    fn finish(&self, epoch: u64) {
        let finished = {
            let mut state = self.lock();
            match &state.active {
                Some(active) if active.epoch == epoch => state.active.take(),
                _ => None,
            }
        };
        let Some(download) = finished else {
            return;
        };

        let summary = download.summary;
        if !download.buffer.is_empty() {
            debug!(
                "Discarding {} trailing byte(s) of an incomplete record",
                download.buffer.len()
            );
        }
        if let Err(e) = download.writer.finish() {
            self.diagnostics.download_write_error();
            warn!("Failed to close download output: {}", e);
        }

        info!(
            "File download complete [{}]: {} record(s), {} byte(s)",
            summary.file_timestamp,
            summary.records(),
            summary.bytes_received
        );
        let _ = self.events.send(WearableEvent::DownloadComplete(summary));
        if let Some(done) = download.done {
            let _ = done.send(summary);
        }
    }

    /// Close an open download without reporting completion
    ///
    /// Returns the partial summary, or `None` if nothing was open.
    pub fn abort(&self) -> Option<DownloadSummary> {
        let download = self.lock().active.take()?;
        if let Some(timer) = download.timer {
            timer.abort();
        }
        if let Err(e) = download.writer.finish() {
            warn!("Failed to close download output: {}", e);
        }
        debug!("Download [{}] aborted", download.summary.file_timestamp);
        Some(download.summary)
    }

    /// Whether a download is open
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }
}
