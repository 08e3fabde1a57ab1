//! Device and stream shared by operator instances.

use std::sync::Arc;

use crossent_common::{CrossEntConfig, DeviceConfig, Result};
use crossent_kernels::{Device, Stream, StreamStats};

/// A device plus the ordered stream every operator launch goes through.
///
/// Cloning is cheap and shares the stream, so a forward and a backward
/// operator built from clones of one context see each other's work in
/// submission order.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    device: Arc<Device>,
    stream: Arc<Stream>,
}

impl ExecutionContext {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let device = Arc::new(Device::new(config)?);
        let stream = Arc::new(Stream::new(Arc::clone(&device))?);
        Ok(Self { device, stream })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DeviceConfig::default())
    }

    /// Build from the device section of a full configuration.
    pub fn from_config(config: &CrossEntConfig) -> Result<Self> {
        Self::new(config.device.clone())
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Wait for all queued work; reports a device fault if one occurred.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }

    pub fn stats(&self) -> StreamStats {
        self.stream.stats()
    }
}
