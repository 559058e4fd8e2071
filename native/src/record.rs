//! Binary layout of the plugin interface record shared with the burn-in host.
//!
//! The host maps a single fixed-size C structure and polls it. Field order,
//! widths and natural C alignment below are the compatibility contract; the
//! offsets are pinned by the tests at the bottom of this file.

use std::mem::{offset_of, size_of};
use thiserror::Error;

/// Interface revision this plugin speaks (host 7.0 adds `error_message_long`).
pub const PLUGIN_INTERFACE_VERSION: i32 = 4;

pub const MAX_DISPLAY_TEXT: usize = 20;
pub const MAX_ERROR_TEXT: usize = 100;
pub const MAX_ERROR_TEXT_LONG: usize = 201;

/// Counter value telling the host an operation category does not apply.
pub const OPERATIONS_NOT_APPLICABLE: i64 = -1;

/// Plugin status codes understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PluginStatus {
    NotUsed = -1,
    NoStatus = 0,
    Startup = 1,
    Allocate = 2,
    Writing = 3,
    Reading = 4,
    Verifying = 5,
    Waiting = 6,
    Cleanup = 7,
    Error = 8,
    /// Tells the host a pre-test plugin is finished and the interface may be closed.
    PretestCompleted = 9,
}

impl PluginStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::NotUsed),
            0 => Some(Self::NoStatus),
            1 => Some(Self::Startup),
            2 => Some(Self::Allocate),
            3 => Some(Self::Writing),
            4 => Some(Self::Reading),
            5 => Some(Self::Verifying),
            6 => Some(Self::Waiting),
            7 => Some(Self::Cleanup),
            8 => Some(Self::Error),
            9 => Some(Self::PretestCompleted),
            _ => None,
        }
    }
}

/// Error severities. Anything above `Warning` counts towards the host's error total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum ErrorSeverity {
    None = 0,
    Information = 1,
    Warning = 2,
    Serious = 3,
    Critical = 4,
    Terminal = 5,
}

impl ErrorSeverity {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Information),
            2 => Some(Self::Warning),
            3 => Some(Self::Serious),
            4 => Some(Self::Critical),
            5 => Some(Self::Terminal),
            _ => None,
        }
    }

    /// Whether publishing this severity increments the durable error count.
    pub fn is_counted(self) -> bool {
        self > ErrorSeverity::Warning
    }
}

/// Generic labelled value slot displayed by the host.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserDefinedSlot {
    pub used: u8,
    pub text: [u8; MAX_DISPLAY_TEXT],
    pub value: [u8; MAX_DISPLAY_TEXT],
}

/// The shared record. Booleans are stored as raw bytes since the host may
/// write any non-zero value.
#[repr(C)]
pub struct InterfaceRecord {
    // Host -> plugin
    pub test_running: i32,
    pub duty_cycle: i32,
    // Plugin -> host
    pub interface_version: i32,
    pub window_title: [u8; MAX_DISPLAY_TEXT],
    pub cycle: u32,
    pub status: i32,
    pub status_message: [u8; MAX_DISPLAY_TEXT],

    pub error_count: i32,
    pub error_message: [u8; MAX_ERROR_TEXT],
    pub error_severity: i32,

    pub write_operations_text: [u8; MAX_DISPLAY_TEXT],
    pub write_operations: i64,
    pub read_operations_text: [u8; MAX_DISPLAY_TEXT],
    pub read_operations: i64,
    pub verify_operations_text: [u8; MAX_DISPLAY_TEXT],
    pub verify_operations: i64,

    pub user_defined_1: UserDefinedSlot,
    pub user_defined_2: UserDefinedSlot,

    // Event flags
    pub new_display_text: u8,
    pub new_error: u8,
    pub new_status: u8,
    pub new_user_defined_1_value: u8,
    pub new_user_defined_2_value: u8,
    pub test_stopped: u8,

    // Interface v3
    pub user_defined_3: UserDefinedSlot,
    pub user_defined_4: UserDefinedSlot,
    pub user_defined_5: UserDefinedSlot,
    pub user_defined_6: UserDefinedSlot,

    // Interface v4
    pub error_message_long: [u8; MAX_ERROR_TEXT_LONG],
}

/// Exact byte size the shared segment must have.
pub const RECORD_SIZE: usize = size_of::<InterfaceRecord>();

/// Single-slot event flags. Plugin raises, host clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFlag {
    DisplayText,
    Error,
    Status,
    UserDefined1,
    UserDefined2,
    TestStopped,
}

impl EventFlag {
    pub const ALL: [EventFlag; 6] = [
        EventFlag::DisplayText,
        EventFlag::Error,
        EventFlag::Status,
        EventFlag::UserDefined1,
        EventFlag::UserDefined2,
        EventFlag::TestStopped,
    ];

    /// Byte offset of the flag inside [`InterfaceRecord`].
    pub fn offset(self) -> usize {
        match self {
            EventFlag::DisplayText => offset_of!(InterfaceRecord, new_display_text),
            EventFlag::Error => offset_of!(InterfaceRecord, new_error),
            EventFlag::Status => offset_of!(InterfaceRecord, new_status),
            EventFlag::UserDefined1 => offset_of!(InterfaceRecord, new_user_defined_1_value),
            EventFlag::UserDefined2 => offset_of!(InterfaceRecord, new_user_defined_2_value),
            EventFlag::TestStopped => offset_of!(InterfaceRecord, test_stopped),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EventFlag::DisplayText => "new_display_text",
            EventFlag::Error => "new_error",
            EventFlag::Status => "new_status",
            EventFlag::UserDefined1 => "new_user_defined_1_value",
            EventFlag::UserDefined2 => "new_user_defined_2_value",
            EventFlag::TestStopped => "test_stopped",
        }
    }
}

/// The six user-defined slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSlot {
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
}

impl UserSlot {
    /// Only the first two slots have a change flag; the rest are picked up on the host's next poll.
    pub fn flag(self) -> Option<EventFlag> {
        match self {
            UserSlot::One => Some(EventFlag::UserDefined1),
            UserSlot::Two => Some(EventFlag::UserDefined2),
            _ => None,
        }
    }

    pub fn offset(self) -> usize {
        match self {
            UserSlot::One => offset_of!(InterfaceRecord, user_defined_1),
            UserSlot::Two => offset_of!(InterfaceRecord, user_defined_2),
            UserSlot::Three => offset_of!(InterfaceRecord, user_defined_3),
            UserSlot::Four => offset_of!(InterfaceRecord, user_defined_4),
            UserSlot::Five => offset_of!(InterfaceRecord, user_defined_5),
            UserSlot::Six => offset_of!(InterfaceRecord, user_defined_6),
        }
    }
}

/// Operation counter categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Write,
    Read,
    Verify,
}

impl Operation {
    pub fn count_offset(self) -> usize {
        match self {
            Operation::Write => offset_of!(InterfaceRecord, write_operations),
            Operation::Read => offset_of!(InterfaceRecord, read_operations),
            Operation::Verify => offset_of!(InterfaceRecord, verify_operations),
        }
    }

    pub fn label_offset(self) -> usize {
        match self {
            Operation::Write => offset_of!(InterfaceRecord, write_operations_text),
            Operation::Read => offset_of!(InterfaceRecord, read_operations_text),
            Operation::Verify => offset_of!(InterfaceRecord, verify_operations_text),
        }
    }

    pub fn default_label(self) -> &'static str {
        match self {
            Operation::Write => "Write:",
            Operation::Read => "Read:",
            Operation::Verify => "Verify:",
        }
    }
}

/// Text did not fit the fixed-width field it was meant for.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field} is {len} bytes, limit is {max}")]
pub struct ValidationError {
    pub field: &'static str,
    pub len: usize,
    pub max: usize,
}

/// Encode UTF-8 text into a zero-padded fixed-width field.
///
/// Text exactly as wide as the field is stored without a terminator, matching
/// how the host's C side reads `char[N]` buffers.
pub fn encode_text<const N: usize>(
    field: &'static str,
    text: &str,
) -> Result<[u8; N], ValidationError> {
    let bytes = text.as_bytes();
    if bytes.len() > N {
        return Err(ValidationError {
            field,
            len: bytes.len(),
            max: N,
        });
    }

    let mut buffer = [0u8; N];
    buffer[..bytes.len()].copy_from_slice(bytes);
    Ok(buffer)
}

/// Decode a fixed-width field up to the first NUL.
pub fn decode_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Fixed-width field for text known to fit, such as built-in labels.
/// Anything longer is cut at a character boundary.
pub(crate) fn padded<const N: usize>(text: &str) -> [u8; N] {
    let fitted = truncate_to_bound(text, N);
    let mut buffer = [0u8; N];
    buffer[..fitted.len()].copy_from_slice(fitted.as_bytes());
    buffer
}

/// Shorten text to at most `max` bytes without splitting a character.
pub fn truncate_to_bound(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
