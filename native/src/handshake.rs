//! Flag handshake with the host.
//!
//! Every publish follows the same sequence: wait for the host to clear the
//! previous event of the category, write the data fields, raise the flag, and
//! optionally wait again for this event to be taken. Waits poll the flag and
//! sleep on the runtime between checks; the host offers no other notification.
//! A wait ends when the flag clears or the host stops reporting `test_running`.

use crate::channel::PluginChannel;
use crate::record::{
    encode_text, ErrorSeverity, EventFlag, InterfaceRecord, PluginStatus, UserSlot,
    ValidationError, MAX_DISPLAY_TEXT, MAX_ERROR_TEXT, MAX_ERROR_TEXT_LONG,
};
use log::{debug, info, warn};
use std::mem::offset_of;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Delay between flag checks while waiting on the host.
pub const ACK_POLL_INTERVAL: Duration = Duration::from_millis(2);

const SLOW_ACK_LOG_POLLS: u64 = 2_500;

/// Re-resolve the segment key every this many polls (about 50 ms).
const SEGMENT_CHECK_POLLS: u64 = 25;

/// Upper bound on the blocking drain in `Drop`.
const DROP_DRAIN_LIMIT: Duration = Duration::from_millis(250);

impl PluginChannel {
    /// Wait until the host clears `flag`, stops the test, or releases the segment.
    pub async fn wait_for_ack(&self, flag: EventFlag) {
        let mut polls: u64 = 0;
        while self.host_listening() && self.is_raised(flag) {
            polls += 1;
            if polls % SEGMENT_CHECK_POLLS == 0 && self.verify_segment().is_err() {
                warn!(
                    "[HANDSHAKE] Segment released while waiting for {}",
                    flag.name()
                );
                return;
            }
            if polls % SLOW_ACK_LOG_POLLS == 0 {
                debug!(
                    "[HANDSHAKE] Still waiting for host to take {} ({} polls)",
                    flag.name(),
                    polls
                );
            }
            tokio::time::sleep(ACK_POLL_INTERVAL).await;
        }
    }

    fn raise(&self, flag: EventFlag) {
        let previous = self.record.flag(flag).swap(1, Ordering::AcqRel);
        if previous != 0 {
            // Only reachable once the host stopped running the test.
            debug!(
                "[HANDSHAKE] {} raised over an untaken event (host not running)",
                flag.name()
            );
        }
    }

    /// Publish a status code and message.
    pub async fn publish_status(
        &mut self,
        status: PluginStatus,
        message: &str,
        wait: bool,
    ) -> Result<(), ValidationError> {
        let message = encode_text::<MAX_DISPLAY_TEXT>("status message", message)?;

        self.wait_for_ack(EventFlag::Status).await;
        self.record
            .write(offset_of!(InterfaceRecord, status), status.code());
        self.record
            .write(offset_of!(InterfaceRecord, status_message), message);
        self.raise(EventFlag::Status);

        if wait {
            self.wait_for_ack(EventFlag::Status).await;
        }
        Ok(())
    }

    /// Publish an error. Severities above `Warning` increment the error count.
    pub async fn publish_error(
        &mut self,
        severity: ErrorSeverity,
        message: &str,
        wait: bool,
    ) -> Result<(), ValidationError> {
        let message = encode_text::<MAX_ERROR_TEXT>("error message", message)?;
        self.publish_error_fields(severity, message, [0u8; MAX_ERROR_TEXT_LONG], wait)
            .await;
        Ok(())
    }

    /// Publish an error with the extended description field filled in as well.
    pub async fn publish_error_detailed(
        &mut self,
        severity: ErrorSeverity,
        message: &str,
        detail: &str,
        wait: bool,
    ) -> Result<(), ValidationError> {
        let message = encode_text::<MAX_ERROR_TEXT>("error message", message)?;
        let detail = encode_text::<MAX_ERROR_TEXT_LONG>("error detail", detail)?;
        self.publish_error_fields(severity, message, detail, wait)
            .await;
        Ok(())
    }

    async fn publish_error_fields(
        &mut self,
        severity: ErrorSeverity,
        message: [u8; MAX_ERROR_TEXT],
        detail: [u8; MAX_ERROR_TEXT_LONG],
        wait: bool,
    ) {
        self.wait_for_ack(EventFlag::Error).await;

        if severity.is_counted() {
            let total = self.bump_error_count();
            warn!("[HANDSHAKE] {:?} error reported ({} total)", severity, total);
        }

        self.record
            .write(offset_of!(InterfaceRecord, error_severity), severity.code());
        self.record
            .write(offset_of!(InterfaceRecord, error_message), message);
        self.record
            .write(offset_of!(InterfaceRecord, error_message_long), detail);
        self.raise(EventFlag::Error);

        if wait {
            self.wait_for_ack(EventFlag::Error).await;
        }
    }

    /// Tell the host this pre-test plugin is done and the interface may be closed.
    pub async fn publish_pretest_complete(&mut self, wait: bool) {
        self.wait_for_ack(EventFlag::Status).await;
        self.record.write(
            offset_of!(InterfaceRecord, status),
            PluginStatus::PretestCompleted.code(),
        );
        self.raise(EventFlag::Status);
        info!("[HANDSHAKE] Pre-test completion signalled");

        if wait {
            self.wait_for_ack(EventFlag::Status).await;
        }
    }

    /// Replace the window title shown by the host.
    pub async fn publish_display_text(
        &mut self,
        window_title: &str,
        wait: bool,
    ) -> Result<(), ValidationError> {
        let title = encode_text::<MAX_DISPLAY_TEXT>("window title", window_title)?;

        self.wait_for_ack(EventFlag::DisplayText).await;
        self.record
            .write(offset_of!(InterfaceRecord, window_title), title);
        self.raise(EventFlag::DisplayText);

        if wait {
            self.wait_for_ack(EventFlag::DisplayText).await;
        }
        Ok(())
    }

    /// Fill a user-defined slot. Slots one and two go through the handshake;
    /// the others have no change flag and are simply overwritten.
    pub async fn publish_user_defined(
        &mut self,
        slot: UserSlot,
        label: &str,
        value: &str,
        wait: bool,
    ) -> Result<(), ValidationError> {
        let label = encode_text::<MAX_DISPLAY_TEXT>("user defined label", label)?;
        let value = encode_text::<MAX_DISPLAY_TEXT>("user defined value", value)?;
        let flag = slot.flag();

        if let Some(flag) = flag {
            self.wait_for_ack(flag).await;
        }

        let base = slot.offset();
        self.record.write(base, 1u8);
        self.record.write(base + 1, label);
        self.record.write(base + 1 + MAX_DISPLAY_TEXT, value);

        if let Some(flag) = flag {
            self.raise(flag);
            if wait {
                self.wait_for_ack(flag).await;
            }
        }
        Ok(())
    }

    /// Drain outstanding status and error events, then release the segment.
    pub async fn close(self) {
        self.wait_for_ack(EventFlag::Status).await;
        self.wait_for_ack(EventFlag::Error).await;
        drop(self);
    }
}

impl Drop for PluginChannel {
    fn drop(&mut self) {
        // Best effort only: `close` is the draining path. There is no runtime
        // to yield to here, so the thread sleeps between checks.
        let deadline = Instant::now() + DROP_DRAIN_LIMIT;
        let mut polls: u64 = 0;
        for flag in [EventFlag::Status, EventFlag::Error] {
            while self.host_listening() && self.is_raised(flag) {
                polls += 1;
                if Instant::now() >= deadline
                    || (polls % SEGMENT_CHECK_POLLS == 0 && self.verify_segment().is_err())
                {
                    warn!(
                        "[CHANNEL] Releasing '{}' with {} untaken",
                        self.key(),
                        flag.name()
                    );
                    break;
                }
                std::thread::sleep(ACK_POLL_INTERVAL);
            }
        }
        info!("[CHANNEL] Released '{}'", self.key());
    }
}
