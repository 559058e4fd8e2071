pub mod aggregator;
pub mod channel;
pub mod config;
pub mod device;
pub mod handshake;
#[cfg(any(test, feature = "host-sim"))]
pub mod host;
pub mod logging;
pub mod port;
pub mod record;
pub mod sampling;
pub mod session;
pub mod shm;
pub mod table;

// Re-export the types a host integration works with.
pub use aggregator::{Aggregator, SessionOutcome, TickOutcome};
pub use channel::{OperationCounters, PluginChannel, RecordSnapshot};
pub use config::Settings;
pub use port::{PortEvent, PortModel, Quantity, Thresholds};
pub use record::{ErrorSeverity, EventFlag, Operation, PluginStatus, UserSlot, ValidationError};
pub use sampling::{PortSampler, ReplaySampler, SampleError};
pub use session::{resolve_port_ids, run_session, PluginError};
pub use shm::AttachError;
pub use table::PortTable;

/// Prefix of the process argument carrying the shared memory key.
pub const ATTACH_KEY_MARKER: &str = "-BITKEY:";

/// Read the attach key from the first process argument (program name excluded).
///
/// The argument must start with [`ATTACH_KEY_MARKER`]. An empty key is treated
/// as missing.
pub fn parse_attach_key<I, S>(args: I) -> Result<String, PluginError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .next()
        .and_then(|arg| {
            arg.as_ref()
                .strip_prefix(ATTACH_KEY_MARKER)
                .map(|key| key.trim().to_string())
        })
        .filter(|key| !key.is_empty())
        .ok_or(PluginError::MissingAttachKey(ATTACH_KEY_MARKER))
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
