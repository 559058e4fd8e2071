//! One burn-in session: attach, poll until done, report, release.

use crate::aggregator::{Aggregator, SessionOutcome};
use crate::channel::PluginChannel;
use crate::config::{Settings, SettingsError};
use crate::device::{DeviceCatalog, DeviceError};
use crate::record::{PluginStatus, UserSlot, ValidationError};
use crate::sampling::{PortSampler, SampleError, TraceError};
use crate::shm::AttachError;
use log::{error, info, warn};
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Attach key missing (expected an argument starting with {0})")]
    MissingAttachKey(&'static str),
    #[error("No sample source configured")]
    NoSampleSource,
    #[error("Runtime error: {0}")]
    Runtime(std::io::Error),
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),
}

/// Ports to test: the active device from the catalog when one is
/// configured, otherwise whatever the sampler reports.
pub fn resolve_port_ids<S>(settings: &Settings, sampler: &mut S) -> Result<Vec<u32>, PluginError>
where
    S: PortSampler + ?Sized,
{
    match (&settings.device_directory, &settings.active_device) {
        (Some(dir), Some(name)) => {
            let mut catalog = DeviceCatalog::load(dir)?;
            catalog.set_active_device(name)?;
            Ok(catalog.port_ids()?)
        }
        (Some(_), None) => {
            warn!("[PLUGIN] Device directory set without an active device, using sampler ports");
            Ok(sampler.list_port_ids()?)
        }
        (None, Some(name)) => {
            warn!(
                "[PLUGIN] Active device '{}' set without a device directory, using sampler ports",
                name
            );
            Ok(sampler.list_port_ids()?)
        }
        (None, None) => Ok(sampler.list_port_ids()?),
    }
}

/// Run a complete session against the segment named `key`.
///
/// Attach failures are returned before anything is written. Once attached,
/// the final result is reported to the host unless the segment itself has
/// gone away, and the channel is closed on every path.
pub async fn run_session<S, F>(
    settings: &Settings,
    key: &str,
    sampler: &mut S,
    port_ids: Vec<u32>,
    shutdown: F,
) -> Result<SessionOutcome, PluginError>
where
    S: PortSampler + ?Sized,
    F: Future<Output = ()>,
{
    let mut channel = PluginChannel::attach(key, &settings.window_title)?;
    let result = drive(settings, &mut channel, sampler, port_ids, shutdown).await;
    if let Err(e) = &result {
        error!("[PLUGIN] Session aborted: {}", e);
    }
    channel.close().await;
    result
}

async fn drive<S, F>(
    settings: &Settings,
    channel: &mut PluginChannel,
    sampler: &mut S,
    port_ids: Vec<u32>,
    shutdown: F,
) -> Result<SessionOutcome, PluginError>
where
    S: PortSampler + ?Sized,
    F: Future<Output = ()>,
{
    if port_ids.is_empty() {
        warn!("[PLUGIN] No ports configured, the session can only end when the host stops it");
    }
    let port_list = port_ids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    channel
        .publish_user_defined(UserSlot::One, "Ports", &port_list, false)
        .await
        .unwrap_or_else(|e| warn!("[PLUGIN] Port list not shown: {}", e));
    channel
        .publish_status(PluginStatus::Reading, "Polling ports", false)
        .await?;

    let mut aggregator = Aggregator::with_ports(port_ids, settings.thresholds());
    let outcome = aggregator
        .run(sampler, channel, settings.poll_interval(), shutdown)
        .await?;

    info!("[PLUGIN] Session finished: {:?}", outcome);
    aggregator.report(channel, outcome).await?;
    Ok(outcome)
}
