//! TCP transport

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::{error::*, Transport};

/// TCP transport for network scanners
pub struct TcpTransport {
    addr: String,
    port: u16,
    socket_addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    pending: BytesMut,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Create new TCP transport
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            socket_addr: None,
            stream: None,
            pending: BytesMut::with_capacity(4096),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Create from a `host:port` connection address
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if the port is missing or not a
    /// valid u16.
    pub fn from_address(address: &str) -> Result<Self> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("{address}: missing port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::InvalidAddress(format!("{address}: {e}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, port))
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Resolve address to SocketAddr
    async fn resolve_addr(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.socket_addr {
            return Ok(addr);
        }

        let addr_str = format!("{}:{}", self.addr, self.port);

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&addr_str)
            .await
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", addr_str, e)))?
            .collect();

        let addr = addrs
            .first()
            .ok_or_else(|| Error::InvalidAddress(format!("No addresses found for {}", addr_str)))?;

        self.socket_addr = Some(*addr);
        Ok(*addr)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Err(Error::AlreadyConnected);
        }

        let addr = self.resolve_addr().await?;

        debug!("Connecting to {}...", addr);

        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(Error::Io)?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        debug!("Connected to {}", addr);

        self.pending.clear();
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            debug!("Disconnecting from {}...", self.remote_addr());

            // Graceful shutdown
            let _ = stream.shutdown().await;
        }

        self.pending.clear();
        self.socket_addr = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;

        trace!(len = data.len(), bytes = %hex::encode(&data[..data.len().min(16)]), "Sending");

        stream.write_all(data).await?;
        stream.flush().await?;

        Ok(())
    }

    async fn read_exact(&mut self, len: usize, read_timeout: Duration) -> Result<BytesMut> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let pending = &mut self.pending;

        let fill = async {
            while pending.len() < len {
                pending.reserve(len - pending.len());
                let n = stream.read_buf(pending).await?;
                if n == 0 {
                    return Err(Error::ConnectionClosed);
                }
            }
            Ok(())
        };

        match timeout(read_timeout, fill).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::ReadTimeout {
                    expected: len,
                    received: self.pending.len(),
                });
            }
        }

        let data = self.pending.split_to(len);
        trace!(len, bytes = %hex::encode(&data[..len.min(16)]), "Received");
        Ok(data)
    }

    async fn discard_pending(&mut self) -> Result<usize> {
        let mut discarded = self.pending.len();
        self.pending.clear();

        if let Some(stream) = self.stream.as_mut() {
            let mut scratch = [0u8; 4096];
            loop {
                match stream.try_read(&mut scratch) {
                    Ok(0) => return Err(Error::ConnectionClosed),
                    Ok(n) => discarded += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(Error::Io(e)),
                }
            }
        }

        if discarded > 0 {
            debug!(discarded, "Discarded stale input");
        }
        Ok(discarded)
    }

    fn remote_addr(&self) -> String {
        self.socket_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| format!("{}:{}", self.addr, self.port))
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if self.is_connected() {
            warn!("TCP transport dropped while still connected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport_create() {
        let transport = TcpTransport::new("192.168.1.201", 8612);
        assert!(!transport.is_connected());
        assert_eq!(transport.remote_addr(), "192.168.1.201:8612");
    }

    #[tokio::test]
    async fn test_from_address() {
        let transport = TcpTransport::from_address("10.0.0.7:9100").unwrap();
        assert_eq!(transport.remote_addr(), "10.0.0.7:9100");
        assert!(TcpTransport::from_address("10.0.0.7").is_err());
        assert!(TcpTransport::from_address("10.0.0.7:99999").is_err());
    }

    #[tokio::test]
    async fn test_tcp_transport_invalid_address() {
        let mut transport = TcpTransport::new("invalid..address", 8612)
            .with_connect_timeout(Duration::from_millis(100));

        let result = transport.connect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_exact_reassembles_split_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0x00, 0x04]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            socket.write_all(&[0x00, 1, 2, 3, 4]).await.unwrap();
            socket
        });

        let mut transport = TcpTransport::new("127.0.0.1", addr.port());
        transport.connect().await.unwrap();

        let header = transport.read_exact(3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&header[..], &[0x00, 0x04, 0x00]);
        let payload = transport.read_exact(4, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&payload[..], &[1, 2, 3, 4]);

        let _socket = server.await.unwrap();
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_exact_times_out_and_discards() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[0xAA, 0xBB]).await.unwrap();
            socket
        });

        let mut transport = TcpTransport::new("127.0.0.1", addr.port());
        transport.connect().await.unwrap();
        let _socket = server.await.unwrap();

        let err = transport
            .read_exact(8, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadTimeout { expected: 8, received: 2 }));

        assert_eq!(transport.discard_pending().await.unwrap(), 2);
        transport.disconnect().await.unwrap();
    }
}
