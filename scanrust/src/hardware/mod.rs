//! Hardware-protocol-backed drivers
//!
//! One [`HardwareDriver`] per chipset family. Each open device owns a
//! [`ProtocolAdapter`] that speaks the register/command framing over a
//! [`Transport`](scanrust_transport::Transport) obtained from a
//! [`Connector`]. Chipsets differ only in the static data of
//! [`ChipsetInfo`](scanrust_core::ChipsetInfo): register map, init sequence,
//! resolutions and geometry.
//!
//! [`SimulatedScanner`] speaks the same framing in memory and is what the
//! demos and integration tests drive.

mod adapter;
mod connector;
mod driver;
mod lamp;
mod simulator;

pub use adapter::{DataChunk, ProtocolAdapter};
pub use connector::{Connector, SystemConnector};
pub use driver::{chipset_capabilities, driver_name, HardwareDriver, GAIN_OPTION, OFFSET_OPTION};
pub use lamp::LampGuard;
pub use simulator::{SimulatedConnector, SimulatedScanner, SimulatedTransport};
