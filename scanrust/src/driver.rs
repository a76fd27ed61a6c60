//! Driver contract and the closed set of driver variants

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

use scanrust_core::ChipsetKind;
use scanrust_types::{CapabilityDescriptor, DeviceDescriptor, FrameParameters, ScanParameters};

use crate::emulation::EmulationDriver;
use crate::error::Result;
use crate::handle::DeviceHandle;
use crate::hardware::HardwareDriver;

/// Result of one chunk read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Image bytes for the current frame
    Data(Bytes),
    /// Current frame complete, another follows
    EndOfFrame,
    /// Scan complete
    EndOfStream,
}

/// Backend family of a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    EmulationBacked,
    HardwareProtocolBacked(ChipsetKind),
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmulationBacked => f.write_str("emulation"),
            Self::HardwareProtocolBacked(chipset) => write!(f, "hardware/{chipset}"),
        }
    }
}

/// Uniform contract implemented by every backend
///
/// Each call is one request/response exchange with the backend. Long-running
/// scan loops are driven by [`DeviceSession`](crate::DeviceSession).
#[async_trait]
pub trait ScannerDriver: Send + Sync {
    /// Name matched against descriptor driver hints
    fn name(&self) -> &str;

    fn kind(&self) -> DriverKind;

    /// Pure predicate: does this driver handle `descriptor`?
    fn identify(&self, descriptor: &DeviceDescriptor) -> bool;

    /// Enumerate visible devices; idempotent
    async fn discover(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open exclusively; a second open of the same device is `DeviceBusy`
    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle>;

    async fn capabilities(&self, handle: &DeviceHandle) -> Result<CapabilityDescriptor>;

    /// Validate `params` and program the device with them
    async fn apply_parameters(&self, handle: &DeviceHandle, params: &ScanParameters) -> Result<()>;

    /// Layout of the current (or next) frame
    async fn frame_parameters(&self, handle: &DeviceHandle) -> Result<FrameParameters>;

    async fn start_scan(&self, handle: &DeviceHandle) -> Result<()>;

    async fn read_chunk(&self, handle: &DeviceHandle, max_bytes: usize) -> Result<ReadOutcome>;

    /// Stop the running scan; no-op when idle
    async fn cancel_scan(&self, handle: &DeviceHandle) -> Result<()>;

    /// Force the device back to an idle, initialized state
    async fn reset(&self, handle: &DeviceHandle) -> Result<()>;

    /// Release the device; consumes the handle
    async fn close(&self, handle: DeviceHandle) -> Result<()>;
}

/// Every driver variant
pub enum AnyDriver {
    Emulation(EmulationDriver),
    Hardware(HardwareDriver),
}

macro_rules! dispatch {
    ($self:ident, $driver:ident => $body:expr) => {
        match $self {
            AnyDriver::Emulation($driver) => $body,
            AnyDriver::Hardware($driver) => $body,
        }
    };
}

#[async_trait]
impl ScannerDriver for AnyDriver {
    fn name(&self) -> &str {
        dispatch!(self, d => d.name())
    }

    fn kind(&self) -> DriverKind {
        dispatch!(self, d => d.kind())
    }

    fn identify(&self, descriptor: &DeviceDescriptor) -> bool {
        dispatch!(self, d => d.identify(descriptor))
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        dispatch!(self, d => d.discover().await)
    }

    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle> {
        dispatch!(self, d => d.open(descriptor).await)
    }

    async fn capabilities(&self, handle: &DeviceHandle) -> Result<CapabilityDescriptor> {
        dispatch!(self, d => d.capabilities(handle).await)
    }

    async fn apply_parameters(&self, handle: &DeviceHandle, params: &ScanParameters) -> Result<()> {
        dispatch!(self, d => d.apply_parameters(handle, params).await)
    }

    async fn frame_parameters(&self, handle: &DeviceHandle) -> Result<FrameParameters> {
        dispatch!(self, d => d.frame_parameters(handle).await)
    }

    async fn start_scan(&self, handle: &DeviceHandle) -> Result<()> {
        dispatch!(self, d => d.start_scan(handle).await)
    }

    async fn read_chunk(&self, handle: &DeviceHandle, max_bytes: usize) -> Result<ReadOutcome> {
        dispatch!(self, d => d.read_chunk(handle, max_bytes).await)
    }

    async fn cancel_scan(&self, handle: &DeviceHandle) -> Result<()> {
        dispatch!(self, d => d.cancel_scan(handle).await)
    }

    async fn reset(&self, handle: &DeviceHandle) -> Result<()> {
        dispatch!(self, d => d.reset(handle).await)
    }

    async fn close(&self, handle: DeviceHandle) -> Result<()> {
        dispatch!(self, d => d.close(handle).await)
    }
}

impl From<EmulationDriver> for AnyDriver {
    fn from(driver: EmulationDriver) -> Self {
        Self::Emulation(driver)
    }
}

impl From<HardwareDriver> for AnyDriver {
    fn from(driver: HardwareDriver) -> Self {
        Self::Hardware(driver)
    }
}

impl fmt::Debug for AnyDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyDriver")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}
