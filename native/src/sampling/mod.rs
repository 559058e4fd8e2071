//! Interface to the port measurement library.

pub mod replay;

pub use replay::{Frame, ReplaySampler, TraceError};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("Port {0} is not available")]
    UnknownPort(u32),
    #[error("Hardware access failed on port {port}: {message}")]
    Hardware { port: u32, message: String },
}

/// Source of raw port measurements.
///
/// Any call may fail with a hardware error; the aggregator logs it and skips
/// the affected tick.
pub trait PortSampler {
    fn list_port_ids(&mut self) -> Result<Vec<u32>, SampleError>;
    fn sample_voltage(&mut self, port: u32) -> Result<f64, SampleError>;
    fn sample_current(&mut self, port: u32) -> Result<f64, SampleError>;
    fn sample_power(&mut self, port: u32) -> Result<f64, SampleError>;
}
