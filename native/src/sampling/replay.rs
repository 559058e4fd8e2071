//! Sampler that replays recorded port measurements.
//!
//! Trace files map port ids to frame lists:
//!
//! ```json
//! { "1": [ { "voltage": 45.0, "current": 0.0, "power": 0.0 },
//!          { "voltage": 50.2, "current": 0.11, "power": 5.4 } ] }
//! ```
//!
//! Each voltage sample advances the port to its next frame; current and power
//! read the frame the last voltage sample landed on. The final frame repeats.

use super::{PortSampler, SampleError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default)]
    pub voltage: f64,
    #[serde(default)]
    pub current: f64,
    #[serde(default)]
    pub power: f64,
    /// Simulated hardware fault: every sample on this frame fails with the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl Frame {
    pub fn new(voltage: f64, current: f64, power: f64) -> Self {
        Self {
            voltage,
            current,
            power,
            fault: None,
        }
    }

    pub fn fault(message: &str) -> Self {
        Self {
            voltage: 0.0,
            current: 0.0,
            power: 0.0,
            fault: Some(message.to_string()),
        }
    }
}

pub struct ReplaySampler {
    frames: BTreeMap<u32, Vec<Frame>>,
    position: HashMap<u32, usize>,
}

impl ReplaySampler {
    pub fn new(frames: BTreeMap<u32, Vec<Frame>>) -> Self {
        Self {
            frames,
            position: HashMap::new(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, TraceError> {
        let frames: BTreeMap<u32, Vec<Frame>> = serde_json::from_str(json)?;
        Ok(Self::new(frames))
    }

    pub fn from_file(path: &Path) -> Result<Self, TraceError> {
        let content = fs::read_to_string(path)?;
        let sampler = Self::from_json_str(&content)?;
        debug!(
            "[REPLAY] Loaded trace {:?} with {} ports",
            path,
            sampler.frames.len()
        );
        Ok(sampler)
    }

    fn frame(&self, port: u32) -> Result<&Frame, SampleError> {
        let frames = self
            .frames
            .get(&port)
            .ok_or(SampleError::UnknownPort(port))?;
        let index = self.position.get(&port).copied().unwrap_or(0);
        let frame = frames.get(index).ok_or_else(|| SampleError::Hardware {
            port,
            message: "trace has no frames".to_string(),
        })?;

        match &frame.fault {
            Some(message) => Err(SampleError::Hardware {
                port,
                message: message.clone(),
            }),
            None => Ok(frame),
        }
    }
}

impl PortSampler for ReplaySampler {
    fn list_port_ids(&mut self) -> Result<Vec<u32>, SampleError> {
        Ok(self.frames.keys().copied().collect())
    }

    fn sample_voltage(&mut self, port: u32) -> Result<f64, SampleError> {
        let count = self
            .frames
            .get(&port)
            .map(Vec::len)
            .ok_or(SampleError::UnknownPort(port))?;

        let next = match self.position.get(&port) {
            None => 0,
            Some(&index) => (index + 1).min(count.saturating_sub(1)),
        };
        self.position.insert(port, next);

        self.frame(port).map(|f| f.voltage)
    }

    fn sample_current(&mut self, port: u32) -> Result<f64, SampleError> {
        self.frame(port).map(|f| f.current)
    }

    fn sample_power(&mut self, port: u32) -> Result<f64, SampleError> {
        self.frame(port).map(|f| f.power)
    }
}
