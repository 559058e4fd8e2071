//! Plugin side of the shared interface record.

use crate::record::{
    decode_text, encode_text, padded, ErrorSeverity, EventFlag, InterfaceRecord, Operation,
    PluginStatus, UserSlot, ValidationError, MAX_DISPLAY_TEXT, MAX_ERROR_TEXT,
    MAX_ERROR_TEXT_LONG, OPERATIONS_NOT_APPLICABLE, PLUGIN_INTERFACE_VERSION, RECORD_SIZE,
};
use crate::shm::{AttachError, SharedSegment};
use log::{debug, info, warn};
use std::cell::Cell;
use std::mem::{offset_of, size_of};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

macro_rules! field {
    ($name:ident) => {
        offset_of!(InterfaceRecord, $name)
    };
}

/// Typed volatile access to a mapped [`InterfaceRecord`].
///
/// Host-owned words and event flags are accessed atomically since the other
/// side changes them underneath us; everything else is plugin-owned and only
/// written from the single session task.
pub(crate) struct RecordAccess {
    segment: SharedSegment,
}

impl RecordAccess {
    pub(crate) fn new(segment: SharedSegment) -> Result<Self, AttachError> {
        if segment.len() < RECORD_SIZE {
            return Err(AttachError::WrongSize {
                key: segment.key().to_string(),
                actual: segment.len(),
                expected: RECORD_SIZE,
            });
        }
        Ok(Self { segment })
    }

    pub(crate) fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    fn at<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + size_of::<T>() <= RECORD_SIZE);
        // SAFETY: the offset stays inside the mapped record (length checked in `new`).
        unsafe { self.segment.as_ptr().add(offset).cast() }
    }

    pub(crate) fn read<T: Copy>(&self, offset: usize) -> T {
        // SAFETY: offsets come from `offset_of!` on the repr(C) record, so the
        // pointer is in bounds and aligned for the field type.
        unsafe { self.at::<T>(offset).read_volatile() }
    }

    pub(crate) fn write<T: Copy>(&self, offset: usize, value: T) {
        // SAFETY: see `read`.
        unsafe { self.at::<T>(offset).write_volatile(value) }
    }

    pub(crate) fn flag(&self, flag: EventFlag) -> &AtomicU8 {
        // SAFETY: flags are single bytes inside the mapping, which outlives `self`.
        unsafe { &*(self.at::<u8>(flag.offset()) as *const AtomicU8) }
    }

    pub(crate) fn host_word(&self, offset: usize) -> &AtomicI32 {
        // SAFETY: host words are 4-byte aligned i32 fields inside the mapping.
        unsafe { &*(self.at::<i32>(offset) as *const AtomicI32) }
    }

    pub(crate) fn text<const N: usize>(&self, offset: usize) -> String {
        decode_text(&self.read::<[u8; N]>(offset))
    }

    pub(crate) fn user_defined(&self, slot: UserSlot) -> UserDefinedValue {
        let base = slot.offset();
        UserDefinedValue {
            used: self.read::<u8>(base) != 0,
            label: self.text::<MAX_DISPLAY_TEXT>(base + 1),
            value: self.text::<MAX_DISPLAY_TEXT>(base + 1 + MAX_DISPLAY_TEXT),
        }
    }

    pub(crate) fn snapshot(&self) -> RecordSnapshot {
        let counter = |op: Operation| OperationCounter {
            label: self.text::<MAX_DISPLAY_TEXT>(op.label_offset()),
            count: self.read::<i64>(op.count_offset()),
        };

        RecordSnapshot {
            test_running: self.host_word(field!(test_running)).load(Ordering::Acquire),
            duty_cycle: self.host_word(field!(duty_cycle)).load(Ordering::Acquire),
            interface_version: self.read(field!(interface_version)),
            window_title: self.text::<MAX_DISPLAY_TEXT>(field!(window_title)),
            cycle: self.read(field!(cycle)),
            status: self.read(field!(status)),
            status_message: self.text::<MAX_DISPLAY_TEXT>(field!(status_message)),
            error_count: self.read(field!(error_count)),
            error_message: self.text::<MAX_ERROR_TEXT>(field!(error_message)),
            error_message_long: self.text::<MAX_ERROR_TEXT_LONG>(field!(error_message_long)),
            error_severity: self.read(field!(error_severity)),
            write: counter(Operation::Write),
            read: counter(Operation::Read),
            verify: counter(Operation::Verify),
        }
    }
}

/// Label and count shown by the host for one operation category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationCounter {
    pub label: String,
    pub count: i64,
}

/// Contents of one user-defined slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDefinedValue {
    pub used: bool,
    pub label: String,
    pub value: String,
}

/// Point-in-time copy of the record's scalar and text fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub test_running: i32,
    pub duty_cycle: i32,
    pub interface_version: i32,
    pub window_title: String,
    pub cycle: u32,
    pub status: i32,
    pub status_message: String,
    pub error_count: i32,
    pub error_message: String,
    pub error_message_long: String,
    pub error_severity: i32,
    pub write: OperationCounter,
    pub read: OperationCounter,
    pub verify: OperationCounter,
}

/// Initial operation counts written at attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationCounters {
    pub write: i64,
    pub read: i64,
    pub verify: i64,
}

impl Default for OperationCounters {
    fn default() -> Self {
        Self {
            write: OPERATIONS_NOT_APPLICABLE,
            read: OPERATIONS_NOT_APPLICABLE,
            verify: OPERATIONS_NOT_APPLICABLE,
        }
    }
}

/// The plugin's attachment to the host-provided interface segment.
///
/// Mutating calls take `&mut self`: the record has exactly one plugin-side
/// writer. Publishing with acknowledgment lives in `handshake`.
pub struct PluginChannel {
    pub(crate) record: RecordAccess,
    gone: Cell<bool>,
}

impl PluginChannel {
    /// Attach to the host's segment and initialize every plugin-owned field.
    pub fn attach(key: &str, window_title: &str) -> Result<Self, AttachError> {
        Self::attach_with(key, window_title, OperationCounters::default())
    }

    pub fn attach_with(
        key: &str,
        window_title: &str,
        counters: OperationCounters,
    ) -> Result<Self, AttachError> {
        let title = encode_text::<MAX_DISPLAY_TEXT>("window_title", window_title)?;
        let segment = SharedSegment::open(key, RECORD_SIZE)?;

        let channel = Self {
            record: RecordAccess::new(segment)?,
            gone: Cell::new(false),
        };
        channel.initialize(title, counters);

        info!(
            "[CHANNEL] Attached to '{}' (interface v{})",
            key, PLUGIN_INTERFACE_VERSION
        );
        Ok(channel)
    }

    fn initialize(&self, title: [u8; MAX_DISPLAY_TEXT], counters: OperationCounters) {
        let r = &self.record;

        r.write(field!(interface_version), PLUGIN_INTERFACE_VERSION);
        r.write(field!(cycle), 0u32);
        r.write(field!(error_count), 0i32);
        r.write(field!(error_severity), ErrorSeverity::None.code());
        r.write(field!(status), PluginStatus::NoStatus.code());

        r.write(Operation::Write.count_offset(), counters.write);
        r.write(Operation::Read.count_offset(), counters.read);
        r.write(Operation::Verify.count_offset(), counters.verify);

        for flag in EventFlag::ALL {
            r.flag(flag).store(0, Ordering::Release);
        }

        r.write(field!(window_title), title);
        r.write(
            field!(status_message),
            padded::<MAX_DISPLAY_TEXT>("Starting"),
        );
        r.write(field!(error_message), [0u8; MAX_ERROR_TEXT]);
        r.write(field!(error_message_long), [0u8; MAX_ERROR_TEXT_LONG]);
        for op in [Operation::Write, Operation::Read, Operation::Verify] {
            r.write(
                op.label_offset(),
                padded::<MAX_DISPLAY_TEXT>(op.default_label()),
            );
        }

        // Announce the freshly written display text.
        r.flag(EventFlag::DisplayText).store(1, Ordering::Release);
    }

    pub fn key(&self) -> &str {
        self.record.segment().key()
    }

    /// Host reports the test as running. Read fresh from the segment on every call.
    pub fn test_running(&self) -> bool {
        self.record
            .host_word(field!(test_running))
            .load(Ordering::Acquire)
            == 1
    }

    pub fn duty_cycle(&self) -> i32 {
        self.record
            .host_word(field!(duty_cycle))
            .load(Ordering::Acquire)
    }

    pub fn is_raised(&self, flag: EventFlag) -> bool {
        self.record.flag(flag).load(Ordering::Acquire) != 0
    }

    /// Fails with [`AttachError::SegmentGone`] once the host has released the segment.
    ///
    /// A failure is remembered: from then on no wait blocks on the host.
    pub fn verify_segment(&self) -> Result<(), AttachError> {
        if self.gone.get() {
            return Err(AttachError::SegmentGone(self.key().to_string()));
        }
        self.record.segment().verify().inspect_err(|e| {
            warn!("[CHANNEL] {}", e);
            self.gone.set(true);
        })
    }

    /// The host is still there to take events: it reports the test as
    /// running and the segment has not been released.
    pub(crate) fn host_listening(&self) -> bool {
        !self.gone.get() && self.test_running()
    }

    pub fn cycle(&self) -> u32 {
        self.record.read(field!(cycle))
    }

    pub fn set_cycle(&mut self, cycle: u32) {
        self.record.write(field!(cycle), cycle);
    }

    pub fn increment_cycle(&mut self) -> u32 {
        let next = self.cycle().wrapping_add(1);
        self.set_cycle(next);
        next
    }

    pub fn error_count(&self) -> i32 {
        self.record.read(field!(error_count))
    }

    pub(crate) fn bump_error_count(&mut self) -> i32 {
        let next = self.error_count().saturating_add(1);
        self.record.write(field!(error_count), next);
        next
    }

    pub fn operations(&self, op: Operation) -> i64 {
        self.record.read(op.count_offset())
    }

    pub fn set_operations(&mut self, op: Operation, count: i64) {
        self.record.write(op.count_offset(), count);
    }

    /// Add `by` to a counter. A counter still marked not-applicable starts from zero.
    pub fn count_operations(&mut self, op: Operation, by: i64) -> i64 {
        let current = self.operations(op).max(0);
        let next = current.saturating_add(by);
        self.set_operations(op, next);
        next
    }

    pub fn operation_label(&self, op: Operation) -> String {
        self.record.text::<MAX_DISPLAY_TEXT>(op.label_offset())
    }

    pub fn set_operation_label(&mut self, op: Operation, label: &str) -> Result<(), ValidationError> {
        let encoded = encode_text::<MAX_DISPLAY_TEXT>("operation label", label)?;
        self.record.write(op.label_offset(), encoded);
        debug!("[CHANNEL] {:?} label set to '{}'", op, label);
        Ok(())
    }

    pub fn user_defined(&self, slot: UserSlot) -> UserDefinedValue {
        self.record.user_defined(slot)
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        self.record.snapshot()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::host::{test_key, HostView};

    #[test]
    fn attach_initializes_plugin_fields() {
        let key = test_key("init");
        let host = HostView::create(&key).unwrap();
        let channel = PluginChannel::attach(&key, "PoE Burn-In").unwrap();

        let snap = host.snapshot();
        assert_eq!(snap.interface_version, PLUGIN_INTERFACE_VERSION);
        assert_eq!(snap.window_title, "PoE Burn-In");
        assert_eq!(snap.cycle, 0);
        assert_eq!(snap.error_count, 0);
        assert_eq!(snap.error_severity, ErrorSeverity::None.code());
        assert_eq!(snap.status, PluginStatus::NoStatus.code());
        assert_eq!(snap.status_message, "Starting");
        assert_eq!(snap.error_message, "");
        assert_eq!(snap.write.count, -1);
        assert_eq!(snap.read.count, -1);
        assert_eq!(snap.verify.count, -1);
        assert_eq!(snap.write.label, "Write:");
        assert_eq!(snap.read.label, "Read:");
        assert_eq!(snap.verify.label, "Verify:");

        assert!(host.is_raised(EventFlag::DisplayText));
        for flag in [EventFlag::Error, EventFlag::Status, EventFlag::TestStopped] {
            assert!(!host.is_raised(flag), "{} should be clear", flag.name());
        }
        assert_eq!(channel.key(), key);
    }

    #[test]
    fn attach_clears_stale_flags_and_counts() {
        let key = test_key("stale");
        let host = HostView::create(&key).unwrap();
        {
            let mut first = PluginChannel::attach(&key, "first").unwrap();
            first.set_cycle(41);
            first.bump_error_count();
            first.record.flag(EventFlag::Error).store(1, Ordering::Release);
        }

        let _second = PluginChannel::attach(&key, "second").unwrap();
        let snap = host.snapshot();
        assert_eq!(snap.cycle, 0);
        assert_eq!(snap.error_count, 0);
        assert_eq!(snap.window_title, "second");
        assert!(!host.is_raised(EventFlag::Error));
    }

    #[test]
    fn attach_honours_counter_overrides() {
        let key = test_key("ovr");
        let host = HostView::create(&key).unwrap();
        let counters = OperationCounters {
            write: 5,
            ..OperationCounters::default()
        };
        let _channel = PluginChannel::attach_with(&key, "PoE", counters).unwrap();
        let snap = host.snapshot();
        assert_eq!(snap.write.count, 5);
        assert_eq!(snap.read.count, -1);
    }

    #[test]
    fn attach_rejects_long_title_before_touching_segment() {
        let key = test_key("title");
        let host = HostView::create(&key).unwrap();
        let result = PluginChannel::attach(&key, "a window title that is far too long");
        assert!(matches!(result, Err(AttachError::Title(_))));
        assert_eq!(host.snapshot().interface_version, 0);
    }

    #[test]
    fn attach_to_missing_segment_fails() {
        let result = PluginChannel::attach(&test_key("none"), "PoE");
        assert!(matches!(result, Err(AttachError::NotFound(_))));
    }

    #[test]
    fn host_words_are_read_fresh() {
        let key = test_key("live");
        let host = HostView::create(&key).unwrap();
        let channel = PluginChannel::attach(&key, "PoE").unwrap();

        assert!(!channel.test_running());
        host.set_test_running(true);
        host.set_duty_cycle(75);
        assert!(channel.test_running());
        assert_eq!(channel.duty_cycle(), 75);
        host.set_test_running(false);
        assert!(!channel.test_running());
    }

    #[test]
    fn counting_starts_from_not_applicable() {
        let key = test_key("count");
        let _host = HostView::create(&key).unwrap();
        let mut channel = PluginChannel::attach(&key, "PoE").unwrap();

        assert_eq!(channel.count_operations(Operation::Read, 1), 1);
        assert_eq!(channel.count_operations(Operation::Read, 1), 2);
        assert_eq!(channel.count_operations(Operation::Verify, 0), 0);
        assert_eq!(channel.operations(Operation::Write), -1);
    }

    #[test]
    fn operation_labels_are_bounded() {
        let key = test_key("label");
        let _host = HostView::create(&key).unwrap();
        let mut channel = PluginChannel::attach(&key, "PoE").unwrap();

        channel.set_operation_label(Operation::Read, "Samples:").unwrap();
        assert_eq!(channel.operation_label(Operation::Read), "Samples:");
        assert!(channel
            .set_operation_label(Operation::Read, "a label longer than twenty")
            .is_err());
        assert_eq!(channel.operation_label(Operation::Read), "Samples:");
    }

    #[test]
    fn undersized_segment_is_rejected() {
        let key = test_key("short");
        let segment = SharedSegment::create(&key, RECORD_SIZE - 8).unwrap();
        assert!(matches!(
            RecordAccess::new(segment),
            Err(AttachError::WrongSize { actual, expected: RECORD_SIZE, .. }) if actual == RECORD_SIZE - 8
        ));
    }
}
