//! USB bulk transport
//!
//! Blocking libusb transfers run on the blocking thread pool. The device is
//! addressed as `usb:BUS:ADDR`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use tracing::{debug, trace, warn};

use crate::{error::*, Transport};

/// Size of a single bulk IN request
const BULK_READ_SIZE: usize = 64 * 1024;

/// Timeout of each bulk IN request while draining stale input
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Enumerated USB device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDeviceInfo {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl UsbDeviceInfo {
    /// Connection address in `usb:BUS:ADDR` form
    pub fn connection_address(&self) -> String {
        format!("usb:{:03}:{:03}", self.bus, self.address)
    }
}

/// List every USB device visible to libusb
///
/// # Errors
///
/// Returns an error if the libusb context cannot be created or the device
/// list cannot be read.
pub fn enumerate_usb() -> Result<Vec<UsbDeviceInfo>> {
    let context = Context::new()?;
    let mut found = Vec::new();

    for device in context.devices()?.iter() {
        match device.device_descriptor() {
            Ok(desc) => found.push(UsbDeviceInfo {
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            }),
            Err(e) => debug!("Skipping device without descriptor: {}", e),
        }
    }

    Ok(found)
}

/// Parse a `usb:BUS:ADDR` connection address
fn parse_address(address: &str) -> Result<(u8, u8)> {
    let invalid = || Error::InvalidAddress(format!("{address}: expected usb:BUS:ADDR"));
    let rest = address.strip_prefix("usb:").ok_or_else(invalid)?;
    let (bus, addr) = rest.split_once(':').ok_or_else(invalid)?;
    Ok((
        bus.parse().map_err(|_| invalid())?,
        addr.parse().map_err(|_| invalid())?,
    ))
}

struct Endpoints {
    interface: u8,
    bulk_in: u8,
    bulk_out: u8,
}

fn find_bulk_endpoints(device: &Device<Context>) -> Result<Endpoints> {
    let config = device.active_config_descriptor()?;

    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            let mut bulk_in = None;
            let mut bulk_out = None;
            for ep in desc.endpoint_descriptors() {
                if ep.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => bulk_in = bulk_in.or(Some(ep.address())),
                    Direction::Out => bulk_out = bulk_out.or(Some(ep.address())),
                }
            }
            if let (Some(bulk_in), Some(bulk_out)) = (bulk_in, bulk_out) {
                return Ok(Endpoints {
                    interface: desc.interface_number(),
                    bulk_in,
                    bulk_out,
                });
            }
        }
    }

    Err(Error::DeviceNotFound(
        "no interface with bulk IN and OUT endpoints".into(),
    ))
}

/// USB bulk transport
pub struct UsbTransport {
    bus: u8,
    address: u8,
    handle: Option<Arc<DeviceHandle<Context>>>,
    interface: u8,
    bulk_in: u8,
    bulk_out: u8,
    pending: BytesMut,
    write_timeout: Duration,
}

impl UsbTransport {
    /// Create a transport for the device at `bus`/`address`
    pub fn new(bus: u8, address: u8) -> Self {
        Self {
            bus,
            address,
            handle: None,
            interface: 0,
            bulk_in: 0,
            bulk_out: 0,
            pending: BytesMut::new(),
            write_timeout: Duration::from_secs(5),
        }
    }

    /// Create from a `usb:BUS:ADDR` connection address
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] for any other form.
    pub fn from_address(address: &str) -> Result<Self> {
        let (bus, addr) = parse_address(address)?;
        Ok(Self::new(bus, addr))
    }

    /// Set bulk OUT timeout
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    fn handle(&self) -> Result<Arc<DeviceHandle<Context>>> {
        self.handle.clone().ok_or(Error::NotConnected)
    }

    async fn bulk_read(&self, timeout: Duration) -> Result<Vec<u8>> {
        let handle = self.handle()?;
        let endpoint = self.bulk_in;

        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; BULK_READ_SIZE];
            match handle.read_bulk(endpoint, &mut buf, timeout) {
                Ok(n) => {
                    buf.truncate(n);
                    Ok(buf)
                }
                Err(rusb::Error::Timeout) => Ok(Vec::new()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl Transport for UsbTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let (bus, address) = (self.bus, self.address);
        let (handle, endpoints) = tokio::task::spawn_blocking(move || -> Result<_> {
            let context = Context::new()?;
            let device = context
                .devices()?
                .iter()
                .find(|d| d.bus_number() == bus && d.address() == address)
                .ok_or_else(|| Error::DeviceNotFound(format!("usb:{bus:03}:{address:03}")))?;

            let endpoints = find_bulk_endpoints(&device)?;
            let mut handle = device.open()?;
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                debug!("Kernel driver auto-detach unavailable: {}", e);
            }
            handle.claim_interface(endpoints.interface)?;
            Ok((handle, endpoints))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        debug!(
            "Claimed interface {} on {} (in={:#04x}, out={:#04x})",
            endpoints.interface,
            self.remote_addr(),
            endpoints.bulk_in,
            endpoints.bulk_out
        );

        self.interface = endpoints.interface;
        self.bulk_in = endpoints.bulk_in;
        self.bulk_out = endpoints.bulk_out;
        self.pending.clear();
        self.handle = Some(Arc::new(handle));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut handle) = self.handle.take() {
            debug!("Releasing {}", self.remote_addr());
            match Arc::get_mut(&mut handle) {
                Some(handle) => {
                    if let Err(e) = handle.release_interface(self.interface) {
                        warn!("Failed to release interface {}: {}", self.interface, e);
                    }
                }
                None => warn!("USB handle still in use by a transfer; closing on last drop"),
            }
        }
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let handle = self.handle()?;
        let endpoint = self.bulk_out;
        let timeout = self.write_timeout;
        let buf = data.to_vec();

        trace!(len = data.len(), bytes = %hex::encode(&data[..data.len().min(16)]), "Sending");

        tokio::task::spawn_blocking(move || {
            let mut written = 0;
            while written < buf.len() {
                written += handle.write_bulk(endpoint, &buf[written..], timeout)?;
            }
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<BytesMut> {
        let deadline = Instant::now() + timeout;

        while self.pending.len() < len {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ReadTimeout {
                    expected: len,
                    received: self.pending.len(),
                });
            }
            let chunk = self.bulk_read(remaining).await?;
            self.pending.extend_from_slice(&chunk);
        }

        let data = self.pending.split_to(len);
        trace!(len, bytes = %hex::encode(&data[..len.min(16)]), "Received");
        Ok(data)
    }

    async fn discard_pending(&mut self) -> Result<usize> {
        let mut discarded = self.pending.len();
        self.pending.clear();

        loop {
            let chunk = self.bulk_read(DRAIN_TIMEOUT).await?;
            if chunk.is_empty() {
                break;
            }
            discarded += chunk.len();
        }

        if discarded > 0 {
            debug!(discarded, "Discarded stale input");
        }
        Ok(discarded)
    }

    fn remote_addr(&self) -> String {
        format!("usb:{:03}:{:03}", self.bus, self.address)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!("USB transport dropped while still connected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("usb:001:012").unwrap(), (1, 12));
        assert!(parse_address("001:012").is_err());
        assert!(parse_address("usb:1").is_err());
        assert!(parse_address("usb:300:1").is_err());
    }

    #[test]
    fn test_connection_address_round_trip() {
        let info = UsbDeviceInfo {
            bus: 2,
            address: 7,
            vendor_id: 0x04A9,
            product_id: 0x2213,
        };
        let transport = UsbTransport::from_address(&info.connection_address()).unwrap();
        assert_eq!(transport.remote_addr(), "usb:002:007");
        assert!(!transport.is_connected());
    }
}
