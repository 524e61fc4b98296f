use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{oneshot, Mutex as AsyncMutex},
    time::{timeout_at, Instant},
};
use tracing::{debug, warn};

use crate::{
    diagnostics::SessionDiagnostics,
    error::{CommandError, Result},
    protocol::{parse_battery_charge, CommandEnvelope, ControlResponse, Opcode},
    transport::BleTransport,
    CONTROL_CHAR_UUID,
};

type CommandOutcome = std::result::Result<ControlResponse, CommandError>;

struct PendingCommand {
    opcode: Opcode,
    deadline: Instant,
    responder: oneshot::Sender<CommandOutcome>,
}

struct ChannelState {
    next_tag: u16,
    pending: HashMap<u16, PendingCommand>,
    closed: bool,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            next_tag: 1,
            pending: HashMap::new(),
            closed: false,
        }
    }

    /// Next tag in `1..=65535`, skipping tags that are still pending
    fn allocate_tag(&mut self) -> u16 {
        let mut tag = self.next_tag;
        for _ in 0..u16::MAX {
            tag = self.next_tag;
            self.next_tag = if tag == u16::MAX { 1 } else { tag + 1 };
            if !self.pending.contains_key(&tag) {
                break;
            }
        }
        tag
    }
}

/// Removes a pending entry when its `send` finishes or is dropped
struct PendingGuard<'a> {
    channel: &'a CommandChannel,
    tag: u16,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.channel.lock_state().pending.remove(&self.tag);
    }
}

/// What a control notification turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlNotification {
    /// A command response; `matched` is false when no pending command had its tag
    Response {
        /// Whether a pending command was resolved
        matched: bool,
    },
    /// Unsolicited battery charge push
    BatteryStatus {
        /// Raw charge counter
        charge: u32,
    },
    /// Too short to interpret
    Malformed,
}

/// Request/response channel over the control characteristic
///
/// Only one command is in flight at a time; callers queue on an async gate.
/// Responses are matched to commands by tag, so a response that shows up
/// after its command timed out is dropped.
pub struct CommandChannel {
    transport: Arc<dyn BleTransport>,
    gate: AsyncMutex<()>,
    state: Mutex<ChannelState>,
    timeout: Duration,
    diagnostics: Arc<SessionDiagnostics>,
}

impl CommandChannel {
    /// Create a channel writing to the control characteristic of `transport`
    #[must_use]
    pub fn new(
        transport: Arc<dyn BleTransport>,
        timeout: Duration,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Self {
        Self {
            transport,
            gate: AsyncMutex::new(()),
            state: Mutex::new(ChannelState::new()),
            timeout,
            diagnostics,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a command and wait for the response carrying its tag
    ///
    /// The response is returned whatever its code; use
    /// [`ControlResponse::is_success`] to check it.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotConnected`] if the channel is closed, or closes while waiting
    /// - [`CommandError::Timeout`] if no matching response arrives in time
    /// - Any transport error from the write
    pub async fn send(&self, opcode: Opcode, param: Option<u32>) -> Result<ControlResponse> {
        let _gate = self.gate.lock().await;

        let deadline = Instant::now() + self.timeout;
        let (responder, response) = oneshot::channel();
        let tag = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(CommandError::NotConnected.into());
            }
            let tag = state.allocate_tag();
            state.pending.insert(
                tag,
                PendingCommand {
                    opcode,
                    deadline,
                    responder,
                },
            );
            tag
        };
        let _pending = PendingGuard { channel: self, tag };

        let envelope = CommandEnvelope::new(opcode, tag, param);
        if let Err(e) = self
            .transport
            .write(CONTROL_CHAR_UUID, &envelope.to_bytes())
            .await
        {
            warn!("Failed to send {} tag {}: {}", opcode, tag, e);
            return Err(e);
        }
        debug!("Sent 0x{:04X} ({}) tag {}", opcode.code(), opcode, tag);

        match timeout_at(deadline, response).await {
            Ok(Ok(outcome)) => Ok(outcome?),
            Ok(Err(_)) => Err(CommandError::NotConnected.into()),
            Err(_) => {
                self.diagnostics.command_timeout();
                let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!("{} tag {} timed out after {}ms", opcode, tag, timeout_ms);
                Err(CommandError::Timeout {
                    opcode,
                    tag,
                    timeout_ms,
                }
                .into())
            }
        }
    }

    /// Handle a notification from the control characteristic
    ///
    /// Battery pushes never touch the pending table; they are reported back
    /// for the session to complete asynchronously.
    pub fn handle_notification(&self, data: &[u8]) -> ControlNotification {
        self.diagnostics.control_notification();

        let response = match ControlResponse::from_bytes(data) {
            Ok(response) => response,
            Err(e) => {
                warn!("Ignoring control notification: {}", e);
                return ControlNotification::Malformed;
            }
        };

        if response.is_battery_status() {
            self.diagnostics.battery_push();
            return match parse_battery_charge(&response.payload) {
                Some(charge) => ControlNotification::BatteryStatus { charge },
                None => {
                    warn!(
                        "Battery status received but payload too short (length={})",
                        response.payload.len()
                    );
                    ControlNotification::Malformed
                }
            };
        }

        let pending = self.lock_state().pending.remove(&response.tag);
        match pending {
            Some(command) => {
                let remaining = command.deadline.saturating_duration_since(Instant::now());
                debug!(
                    "Response to {}: {} ({}ms to spare)",
                    command.opcode,
                    response.name(),
                    remaining.as_millis()
                );
                self.diagnostics.response_matched();
                // The caller may have given up already; its loss.
                let _ = command.responder.send(Ok(response));
                ControlNotification::Response { matched: true }
            }
            None => {
                warn!(
                    "Response: {} (tag {} not pending, dropped)",
                    response.name(),
                    response.tag
                );
                self.diagnostics.response_unmatched();
                ControlNotification::Response { matched: false }
            }
        }
    }

    /// Close the channel and fail every pending command with [`CommandError::NotConnected`]
    ///
    /// Returns the number of commands that were failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingCommand> = {
            let mut state = self.lock_state();
            state.closed = true;
            state.pending.drain().map(|(_, command)| command).collect()
        };

        let count = drained.len();
        for command in drained {
            debug!("Failing pending {}: not connected", command.opcode);
            let _ = command.responder.send(Err(CommandError::NotConnected));
        }
        count
    }

    /// Number of commands awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Whether the channel was closed by [`fail_all`](Self::fail_all)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::TymewearError, mock::MockTransport, types::DeviceAddress};
    use tokio_test::{assert_err, assert_ok};

    fn channel(mock: &Arc<MockTransport>) -> Arc<CommandChannel> {
        Arc::new(CommandChannel::new(
            mock.clone(),
            Duration::from_secs(10),
            Arc::new(SessionDiagnostics::new(DeviceAddress(1))),
        ))
    }

    fn response(code: u16, tag: u16, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&code.to_le_bytes());
        data.extend_from_slice(&tag.to_le_bytes());
        data.extend_from_slice(payload);
        data
    }

    async fn wait_for_writes(mock: &MockTransport, count: usize) {
        while mock.writes().len() < count {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_tags_start_at_one_and_wrap() {
        let mut state = ChannelState::new();
        assert_eq!(state.allocate_tag(), 1);
        assert_eq!(state.allocate_tag(), 2);

        state.next_tag = u16::MAX;
        assert_eq!(state.allocate_tag(), u16::MAX);
        assert_eq!(state.allocate_tag(), 1);
    }

    #[test]
    fn test_tag_allocation_skips_pending_tags() {
        let mut state = ChannelState::new();
        let (responder, _response) = oneshot::channel();
        state.pending.insert(
            1,
            PendingCommand {
                opcode: Opcode::GetInfo,
                deadline: Instant::now(),
                responder,
            },
        );
        assert_eq!(state.allocate_tag(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_resolves_only_matching_tag() {
        let mock = Arc::new(MockTransport::tymewear());
        let channel = channel(&mock);

        let sender = channel.clone();
        let task = tokio::spawn(async move { sender.send(Opcode::ListFiles, None).await });
        wait_for_writes(&mock, 1).await;

        let (_, written) = mock.writes()[0].clone();
        assert_eq!(written, vec![0x09, 0x01, 0x01, 0x00]);

        let unrelated = channel.handle_notification(&response(0x8000, 99, &[]));
        assert_eq!(unrelated, ControlNotification::Response { matched: false });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_finished());
        assert_eq!(channel.pending_count(), 1);

        let matched = channel.handle_notification(&response(0x8000, 1, &[0xAB]));
        assert_eq!(matched, ControlNotification::Response { matched: true });

        let reply = assert_ok!(task.await.unwrap());
        assert_eq!(reply.tag, 1);
        assert_eq!(&reply.payload[..], &[0xAB]);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_tags_still_match() {
        let mock = Arc::new(MockTransport::tymewear());
        let channel = channel(&mock);

        // Skip ahead so the command gets tag 500.
        channel.lock_state().next_tag = 500;
        let sender = channel.clone();
        let task = tokio::spawn(async move { sender.send(Opcode::GetInfo, None).await });
        wait_for_writes(&mock, 1).await;

        for stray in [499u16, 501, 1] {
            channel.handle_notification(&response(0x8000, stray, &[]));
        }
        channel.handle_notification(&response(0x8200, 500, &[]));

        let reply = assert_ok!(task.await.unwrap());
        assert_eq!(reply.tag, 500);
        assert!(!reply.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_entry() {
        let mock = Arc::new(MockTransport::tymewear());
        let channel = channel(&mock);

        let result = channel.send(Opcode::StartActivity, None).await;
        match assert_err!(result) {
            TymewearError::Command(CommandError::Timeout {
                opcode,
                tag,
                timeout_ms,
            }) => {
                assert_eq!(opcode, Opcode::StartActivity);
                assert_eq!(tag, 1);
                assert_eq!(timeout_ms, 10_000);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(channel.pending_count(), 0);

        let late = channel.handle_notification(&response(0x8000, 1, &[]));
        assert_eq!(late, ControlNotification::Response { matched: false });
        assert_eq!(channel.diagnostics.snapshot().command_timeouts, 1);
        assert_eq!(channel.diagnostics.snapshot().responses_unmatched, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_answers_within_write() {
        let mock = Arc::new(MockTransport::tymewear());
        mock.respond_with_success();
        let channel = channel(&mock);
        let receiver = Arc::downgrade(&channel);
        mock.set_notification_handler(
            CONTROL_CHAR_UUID,
            Arc::new(move |data: &[u8]| {
                if let Some(channel) = receiver.upgrade() {
                    channel.handle_notification(data);
                }
            }),
        );

        let first = assert_ok!(channel.send(Opcode::SyncRtc, Some(1_700_000_000)).await);
        let second = assert_ok!(channel.send(Opcode::StopActivity, None).await);
        assert_eq!(first.tag, 1);
        assert_eq!(second.tag, 2);
        assert!(first.is_success());

        let (_, written) = mock.writes()[0].clone();
        assert_eq!(&written[4..8], &1_700_000_000u32.to_le_bytes());
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(channel.diagnostics.snapshot().command_timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_sends_release_their_tags() {
        let mock = Arc::new(MockTransport::tymewear());
        let channel = channel(&mock);

        for _ in 0..5 {
            let abandoned =
                tokio::time::timeout(Duration::from_millis(100), channel.send(Opcode::GetInfo, None))
                    .await;
            assert!(abandoned.is_err());
        }
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(channel.diagnostics.snapshot().command_timeouts, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(channel.pending_count(), 0);

        // Tags keep advancing; nothing is left blocking the allocator.
        assert_eq!(channel.lock_state().allocate_tag(), 6);
        let late = channel.handle_notification(&response(0x8000, 3, &[]));
        assert_eq!(late, ControlNotification::Response { matched: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_push_bypasses_pending_table() {
        let mock = Arc::new(MockTransport::tymewear());
        let channel = channel(&mock);

        let sender = channel.clone();
        let task = tokio::spawn(async move { sender.send(Opcode::GetInfo, None).await });
        wait_for_writes(&mock, 1).await;

        // A battery push whose counter equals the pending tag must not resolve it.
        let push = response(0x4002, 1, &5_000u32.to_le_bytes());
        assert_eq!(
            channel.handle_notification(&push),
            ControlNotification::BatteryStatus { charge: 5_000 }
        );
        assert_eq!(channel.pending_count(), 1);

        assert_eq!(
            channel.handle_notification(&response(0x4002, 2, &[0x01])),
            ControlNotification::Malformed
        );

        channel.handle_notification(&response(0x8000, 1, &[]));
        assert_ok!(task.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_all_rejects_pending_and_future_commands() {
        let mock = Arc::new(MockTransport::tymewear());
        let channel = channel(&mock);

        let sender = channel.clone();
        let task = tokio::spawn(async move { sender.send(Opcode::ListFiles, None).await });
        wait_for_writes(&mock, 1).await;

        assert_eq!(channel.fail_all(), 1);
        assert!(matches!(
            task.await.unwrap(),
            Err(TymewearError::Command(CommandError::NotConnected))
        ));
        assert!(matches!(
            channel.send(Opcode::GetInfo, None).await,
            Err(TymewearError::Command(CommandError::NotConnected))
        ));
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_clears_pending_entry() {
        let mock = Arc::new(MockTransport::tymewear());
        mock.fail_writes(true);
        let channel = channel(&mock);

        assert!(matches!(
            channel.send(Opcode::EraseFiles, None).await,
            Err(TymewearError::Transport(_))
        ));
        assert_eq!(channel.pending_count(), 0);
    }

    #[test]
    fn test_malformed_notification() {
        let mock = Arc::new(MockTransport::tymewear());
        let channel = channel(&mock);
        assert_eq!(
            channel.handle_notification(&[0x00, 0x80]),
            ControlNotification::Malformed
        );
    }
}
