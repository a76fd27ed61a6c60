//! Device descriptor structures

use std::fmt;

use crate::error::{Error, Result};

/// How a device is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Network,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb => f.write_str("usb"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// Discovered device
///
/// Produced by driver enumeration or by external discovery collaborators.
/// Immutable once created; lives as long as the discovery snapshot holding it.
///
/// # Examples
///
/// ```
/// use scanrust_types::{DeviceDescriptor, TransportKind};
///
/// let descriptor = DeviceDescriptor::new(
///     "net:192.168.1.40",
///     "Canon",
///     "PIXMA MG5750",
///     TransportKind::Network,
///     "192.168.1.40:8612",
/// )
/// .with_driver_hint("chipset:rts8822");
///
/// assert_eq!(descriptor.driver_hint(), Some("chipset:rts8822"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    id: String,
    vendor: String,
    model: String,
    transport_kind: TransportKind,
    connection_address: String,
    driver_hint: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(
        id: impl Into<String>,
        vendor: impl Into<String>,
        model: impl Into<String>,
        transport_kind: TransportKind,
        connection_address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            vendor: vendor.into(),
            model: model.into(),
            transport_kind,
            connection_address: connection_address.into(),
            driver_hint: None,
        }
    }

    pub fn with_driver_hint(mut self, hint: impl Into<String>) -> Self {
        self.driver_hint = Some(hint.into());
        self
    }

    /// Stable identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    /// USB path (`usb:BUS:ADDR`), `host:port`, or an emulated device name
    pub fn connection_address(&self) -> &str {
        &self.connection_address
    }

    pub fn driver_hint(&self) -> Option<&str> {
        self.driver_hint.as_deref()
    }

    /// Check field validity
    ///
    /// Network descriptors must carry a `host:port` address with a numeric
    /// port. Identifier and address must be non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidDescriptor("empty id".into()));
        }
        if self.connection_address.trim().is_empty() {
            return Err(Error::InvalidDescriptor(format!(
                "{}: empty connection address",
                self.id
            )));
        }
        if self.transport_kind == TransportKind::Network {
            let (host, port) = self.connection_address.rsplit_once(':').ok_or_else(|| {
                Error::InvalidDescriptor(format!(
                    "{}: network address {} lacks a port",
                    self.id, self.connection_address
                ))
            })?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(Error::InvalidDescriptor(format!(
                    "{}: malformed network address {}",
                    self.id, self.connection_address
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}] ({}://{})",
            self.vendor, self.model, self.id, self.transport_kind, self.connection_address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_network_address() {
        let ok = DeviceDescriptor::new("a", "v", "m", TransportKind::Network, "10.0.0.2:1865");
        assert!(ok.validate().is_ok());

        let no_port = DeviceDescriptor::new("a", "v", "m", TransportKind::Network, "10.0.0.2");
        assert!(no_port.validate().is_err());

        let bad_port = DeviceDescriptor::new("a", "v", "m", TransportKind::Network, "host:http");
        assert!(bad_port.validate().is_err());
    }

    #[test]
    fn test_validate_empty_fields() {
        let empty_id = DeviceDescriptor::new(" ", "v", "m", TransportKind::Usb, "usb:001:002");
        assert!(empty_id.validate().is_err());

        let empty_addr = DeviceDescriptor::new("x", "v", "m", TransportKind::Usb, "");
        assert!(empty_addr.validate().is_err());
    }

    #[test]
    fn test_display() {
        let d = DeviceDescriptor::new("sane:test:0", "Noname", "frontend-tester", TransportKind::Usb, "test:0");
        assert_eq!(d.to_string(), "Noname frontend-tester [sane:test:0] (usb://test:0)");
    }
}
