use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("No device selected")]
    NoDeviceSelected,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// One device under test as described on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<u32>,
}

/// Device descriptors found in a directory, keyed by name.
#[derive(Debug, Default)]
pub struct DeviceCatalog {
    devices: BTreeMap<String, (DeviceDescriptor, PathBuf)>,
    active: Option<String>,
}

impl DeviceCatalog {
    /// Read every `*.json` descriptor in `dir`. Unreadable or malformed files
    /// are skipped. A missing directory yields an empty catalog.
    pub fn load(dir: &Path) -> Result<Self, DeviceError> {
        let mut catalog = Self::default();
        if !dir.exists() {
            warn!("[DEVICE] Descriptor directory {:?} does not exist", dir);
            return Ok(catalog);
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            match read_descriptor(&path) {
                Ok(descriptor) => {
                    if let Some((_, previous)) = catalog.devices.get(&descriptor.name) {
                        warn!(
                            "[DEVICE] '{}' in {:?} replaces the descriptor from {:?}",
                            descriptor.name, path, previous
                        );
                    }
                    debug!(
                        "[DEVICE] Loaded '{}' ({} ports)",
                        descriptor.name,
                        descriptor.ports.len()
                    );
                    catalog
                        .devices
                        .insert(descriptor.name.clone(), (descriptor, path));
                }
                Err(e) => warn!("[DEVICE] Skipping descriptor {:?}: {}", path, e),
            }
        }

        info!("[DEVICE] Loaded {} device descriptors", catalog.devices.len());
        Ok(catalog)
    }

    pub fn device_names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<&DeviceDescriptor> {
        self.devices.get(name).map(|(descriptor, _)| descriptor)
    }

    pub fn set_active_device(&mut self, name: &str) -> Result<(), DeviceError> {
        if !self.devices.contains_key(name) {
            return Err(DeviceError::DeviceNotFound(name.to_string()));
        }
        self.active = Some(name.to_string());
        info!("[DEVICE] Active device: {}", name);
        Ok(())
    }

    pub fn active_device(&self) -> Option<&DeviceDescriptor> {
        self.active.as_deref().and_then(|name| self.descriptor(name))
    }

    /// Port ids of the active device.
    pub fn port_ids(&self) -> Result<Vec<u32>, DeviceError> {
        self.active_device()
            .map(|d| d.ports.clone())
            .ok_or(DeviceError::NoDeviceSelected)
    }
}

fn read_descriptor(path: &Path) -> Result<DeviceDescriptor, DeviceError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
