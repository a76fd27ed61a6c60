//! Transport construction from device descriptors

use std::time::Duration;

use async_trait::async_trait;
use scanrust_core::{constants, ChipsetKind};
use scanrust_transport::{TcpTransport, Transport};
use scanrust_types::{DeviceDescriptor, TransportKind};
use tracing::debug;

use crate::error::{Error, Result};

/// Produces connected transports for a hardware driver
#[async_trait]
pub trait Connector: Send + Sync {
    /// Devices of `chipset` reachable through this connector
    async fn enumerate(&self, chipset: ChipsetKind) -> Result<Vec<DeviceDescriptor>>;

    /// Open a connected transport to `descriptor`
    async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Transport>>;
}

/// Connector for real devices: TCP always, USB with the `usb` feature
///
/// Network devices are not discovered here; they are listed with
/// [`SystemConnector::with_network_device`] or pushed into the registry by a
/// discovery collaborator.
pub struct SystemConnector {
    connect_timeout: Duration,
    network_devices: Vec<DeviceDescriptor>,
}

impl SystemConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: constants::DEFAULT_CONNECT_TIMEOUT,
            network_devices: Vec::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Add a statically configured network device
    pub fn with_network_device(mut self, descriptor: DeviceDescriptor) -> Self {
        self.network_devices.push(descriptor);
        self
    }

    #[cfg(feature = "usb")]
    async fn enumerate_usb(chipset: ChipsetKind) -> Result<Vec<DeviceDescriptor>> {
        let found = tokio::task::spawn_blocking(scanrust_transport::enumerate_usb)
            .await
            .map_err(|e| Error::new(scanrust_types::ErrorKind::CommunicationError, e.to_string()))??;

        let info = chipset.info();
        Ok(found
            .into_iter()
            .filter(|dev| info.matches_usb_id(dev.vendor_id, dev.product_id))
            .map(|dev| {
                let address = dev.connection_address();
                DeviceDescriptor::new(
                    address.clone(),
                    info.vendor,
                    info.models.first().copied().unwrap_or(info.name),
                    TransportKind::Usb,
                    address,
                )
                .with_driver_hint(super::driver_name(chipset))
            })
            .collect())
    }

    #[cfg(not(feature = "usb"))]
    async fn enumerate_usb(_chipset: ChipsetKind) -> Result<Vec<DeviceDescriptor>> {
        Ok(Vec::new())
    }
}

impl Default for SystemConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn enumerate(&self, chipset: ChipsetKind) -> Result<Vec<DeviceDescriptor>> {
        let mut found = Self::enumerate_usb(chipset).await?;
        let hint = super::driver_name(chipset);
        found.extend(
            self.network_devices
                .iter()
                .filter(|d| d.driver_hint() == Some(hint.as_str()))
                .cloned(),
        );
        debug!("{} device(s) for {}", found.len(), chipset);
        Ok(found)
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Transport>> {
        let mut transport: Box<dyn Transport> = match descriptor.transport_kind() {
            TransportKind::Network => Box::new(
                TcpTransport::from_address(descriptor.connection_address())?
                    .with_connect_timeout(self.connect_timeout),
            ),
            #[cfg(feature = "usb")]
            TransportKind::Usb => Box::new(scanrust_transport::UsbTransport::from_address(
                descriptor.connection_address(),
            )?),
            #[cfg(not(feature = "usb"))]
            TransportKind::Usb => {
                return Err(Error::not_supported(format!(
                    "{}: USB support not compiled in",
                    descriptor.id()
                )));
            }
        };

        transport.connect().await?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scanrust_types::ErrorKind;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_lists_configured_network_devices() {
        let desc = DeviceDescriptor::new("lan0", "Realtek", "RTS8822", TransportKind::Network, "10.0.0.5:8612")
            .with_driver_hint("chipset:rts8822");
        let connector = SystemConnector::new().with_network_device(desc.clone());

        assert_eq!(connector.enumerate(ChipsetKind::Rts8822).await.unwrap(), vec![desc]);
        assert!(connector.enumerate(ChipsetKind::Gl841).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connects_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let desc = DeviceDescriptor::new("lan0", "Realtek", "RTS8822", TransportKind::Network, addr.to_string());

        let transport = SystemConnector::new().connect(&desc).await.unwrap();
        assert!(transport.is_connected());
    }

    #[cfg(not(feature = "usb"))]
    #[tokio::test]
    async fn test_usb_without_feature_is_not_supported() {
        let desc = DeviceDescriptor::new("usb:001:004", "Canon", "LiDE 35", TransportKind::Usb, "usb:001:004");
        let err = SystemConnector::new().connect(&desc).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }
}
