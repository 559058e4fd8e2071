//! Host-side view of the interface record.
//!
//! Plays the part of the burn-in host: creates the segment, drives
//! `test_running`/`duty_cycle` and acknowledges event flags. Built for the
//! test suite, and for host simulators with the `host-sim` feature.

use crate::channel::{RecordAccess, RecordSnapshot, UserDefinedValue};
use crate::record::{EventFlag, InterfaceRecord, UserSlot, RECORD_SIZE};
use crate::shm::{AttachError, SharedSegment};
use std::mem::offset_of;
use std::sync::atomic::Ordering;

pub struct HostView {
    record: RecordAccess,
}

impl HostView {
    /// Create a zeroed segment sized for the record. It is destroyed on drop.
    pub fn create(key: &str) -> Result<Self, AttachError> {
        Ok(Self {
            record: RecordAccess::new(SharedSegment::create(key, RECORD_SIZE)?)?,
        })
    }

    pub fn open(key: &str) -> Result<Self, AttachError> {
        Ok(Self {
            record: RecordAccess::new(SharedSegment::open(key, RECORD_SIZE)?)?,
        })
    }

    pub fn key(&self) -> &str {
        self.record.segment().key()
    }

    pub fn set_test_running(&self, running: bool) {
        self.record
            .host_word(offset_of!(InterfaceRecord, test_running))
            .store(i32::from(running), Ordering::Release);
    }

    pub fn set_duty_cycle(&self, duty_cycle: i32) {
        self.record
            .host_word(offset_of!(InterfaceRecord, duty_cycle))
            .store(duty_cycle, Ordering::Release);
    }

    pub fn is_raised(&self, flag: EventFlag) -> bool {
        self.record.flag(flag).load(Ordering::Acquire) != 0
    }

    pub fn acknowledge(&self, flag: EventFlag) {
        self.record.flag(flag).store(0, Ordering::Release);
    }

    /// Clear `flag` if raised, returning whether there was an event to take.
    pub fn take(&self, flag: EventFlag) -> bool {
        self.record.flag(flag).swap(0, Ordering::AcqRel) != 0
    }

    pub fn user_defined(&self, slot: UserSlot) -> UserDefinedValue {
        self.record.user_defined(slot)
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        self.record.snapshot()
    }
}

/// Segment key unique to this test process.
#[cfg(test)]
pub(crate) fn test_key(tag: &str) -> String {
    use std::sync::atomic::AtomicU32;
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!(
        "poe-{}-{}-{}",
        tag,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}
