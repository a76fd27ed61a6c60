//! Transport layer for scanner register protocols
//!
//! Provides byte-oriented channels to devices over TCP, and USB bulk
//! endpoints with the `usb` feature. Transports carry no protocol knowledge.

pub mod error;
pub mod tcp;
#[cfg(feature = "usb")]
pub mod usb;

pub use error::{Error, Result};
pub use tcp::TcpTransport;
#[cfg(feature = "usb")]
pub use usb::{enumerate_usb, UsbDeviceInfo, UsbTransport};

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;

/// Transport trait for different communication methods
///
/// Every read takes a mandatory timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to device
    async fn connect(&mut self) -> Result<()>;

    /// Disconnect from device
    async fn disconnect(&mut self) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Send raw bytes
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive exactly `len` bytes
    ///
    /// Fails with [`Error::ReadTimeout`] if `len` bytes do not arrive within
    /// `timeout`. Bytes received before the deadline stay buffered until
    /// [`Transport::discard_pending`] is called.
    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<BytesMut>;

    /// Drop buffered and in-flight input, returning the number of bytes
    /// discarded
    ///
    /// Used to resynchronize framing after a timeout.
    async fn discard_pending(&mut self) -> Result<usize> {
        Ok(0)
    }

    /// Get remote address
    fn remote_addr(&self) -> String;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data).await
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<BytesMut> {
        (**self).read_exact(len, timeout).await
    }

    async fn discard_pending(&mut self) -> Result<usize> {
        (**self).discard_pending().await
    }

    fn remote_addr(&self) -> String {
        (**self).remote_addr()
    }
}
