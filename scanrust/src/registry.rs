//! Driver registry and device snapshot

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scanrust_core::ChipsetKind;
use scanrust_types::{DeviceDescriptor, ErrorKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AdapterConfig, SessionConfig};
use crate::driver::{AnyDriver, ScannerDriver};
use crate::emulation::{EmulationDriver, SaneEmulation, VirtualDeviceSpec};
use crate::error::{Error, Result};
use crate::hardware::{Connector, HardwareDriver};
use crate::session::DeviceSession;

/// Hardware driver waiting for `build`
enum PendingDriver {
    /// Built with the builder's adapter config
    Chipset(ChipsetKind, Arc<dyn Connector>),
    /// Used as given
    Configured(HardwareDriver),
}

/// Builder for [`DriverRegistry`]
#[derive(Default)]
pub struct DriverRegistryBuilder {
    emulation: Option<SaneEmulation>,
    drivers: Vec<PendingDriver>,
    adapter_config: AdapterConfig,
    session_config: SessionConfig,
}

impl DriverRegistryBuilder {
    /// Serve the devices of `layer` through an emulation-backed driver
    pub fn with_emulation(mut self, layer: SaneEmulation) -> Self {
        self.emulation = Some(layer);
        self
    }

    /// Emulation layer with the stock virtual devices
    pub fn with_emulation_defaults(self) -> Self {
        self.with_emulation(SaneEmulation::with_default_devices())
    }

    /// Add one virtual device, creating an empty emulation layer if needed
    pub fn with_virtual_device(mut self, spec: VirtualDeviceSpec) -> Self {
        let layer = self
            .emulation
            .get_or_insert_with(|| SaneEmulation::new(Vec::new()));
        if let Err(e) = layer.add_device(spec) {
            warn!("Skipping virtual device: {}", e);
        }
        self
    }

    /// Add a hardware driver for `chipset`, reaching devices through `connector`
    ///
    /// The driver uses the adapter config set on the builder at build time.
    pub fn with_chipset(mut self, chipset: ChipsetKind, connector: Arc<dyn Connector>) -> Self {
        self.drivers.push(PendingDriver::Chipset(chipset, connector));
        self
    }

    /// Add a fully configured hardware driver
    ///
    /// Its adapter config is kept; [`Self::with_adapter_config`] does not
    /// apply to it.
    pub fn with_hardware(mut self, driver: HardwareDriver) -> Self {
        self.drivers.push(PendingDriver::Configured(driver));
        self
    }

    pub fn with_adapter_config(mut self, config: AdapterConfig) -> Self {
        self.adapter_config = config;
        self
    }

    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn build(self) -> DriverRegistry {
        let mut drivers = Vec::with_capacity(self.drivers.len() + 1);
        let emulation = self.emulation.map(Arc::new);

        if let Some(layer) = &emulation {
            drivers.push(Arc::new(AnyDriver::from(EmulationDriver::new(Arc::clone(layer)))));
        }
        for pending in self.drivers {
            let driver = match pending {
                PendingDriver::Chipset(chipset, connector) => HardwareDriver::new(chipset, connector)
                    .with_adapter_config(self.adapter_config.clone()),
                PendingDriver::Configured(driver) => driver,
            };
            drivers.push(Arc::new(AnyDriver::from(driver)));
        }

        info!("Driver registry built with {} driver(s)", drivers.len());
        DriverRegistry {
            drivers,
            emulation,
            session_config: self.session_config,
            devices: parking_lot::RwLock::new(Arc::new(Vec::new())),
            external: parking_lot::Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }
}

/// Available drivers plus the latest snapshot of discovered devices
///
/// The snapshot is copy-on-read: [`DriverRegistry::devices`] hands out an
/// `Arc` that later discoveries never mutate.
pub struct DriverRegistry {
    drivers: Vec<Arc<AnyDriver>>,
    emulation: Option<Arc<SaneEmulation>>,
    session_config: SessionConfig,
    devices: parking_lot::RwLock<Arc<Vec<DeviceDescriptor>>>,
    /// Descriptors pushed in by discovery collaborators
    external: parking_lot::Mutex<Vec<DeviceDescriptor>>,
    shut_down: AtomicBool,
}

impl DriverRegistry {
    pub fn builder() -> DriverRegistryBuilder {
        DriverRegistryBuilder::default()
    }

    /// Registered driver names, in resolution order
    pub fn driver_names(&self) -> Vec<&str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// The emulation layer owned by this registry, if any
    pub fn emulation(&self) -> Option<&Arc<SaneEmulation>> {
        self.emulation.as_ref()
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.session_config
    }

    /// Ask every driver for its devices and rebuild the snapshot
    ///
    /// A failing driver is logged and skipped. Externally ingested devices
    /// are kept. Duplicate ids keep their first occurrence.
    pub async fn discover(&self) -> Result<Arc<Vec<DeviceDescriptor>>> {
        self.ensure_running()?;

        let mut found = Vec::new();
        for driver in &self.drivers {
            match driver.discover().await {
                Ok(devices) => {
                    debug!("{}: {} device(s)", driver.name(), devices.len());
                    found.extend(devices);
                }
                Err(e) => warn!("Discovery through {} failed: {}", driver.name(), e),
            }
        }
        found.extend(self.external.lock().iter().cloned());

        let snapshot = Arc::new(dedupe(found));
        *self.devices.write() = Arc::clone(&snapshot);
        info!("Discovered {} device(s)", snapshot.len());
        Ok(snapshot)
    }

    /// Accept descriptors from a discovery collaborator
    ///
    /// Invalid descriptors and ids already known are skipped. Returns the
    /// number accepted.
    pub fn ingest(&self, descriptors: impl IntoIterator<Item = DeviceDescriptor>) -> Result<usize> {
        self.ensure_running()?;

        let mut accepted = Vec::new();
        {
            let snapshot = self.devices.read();
            let mut known: HashSet<String> = snapshot.iter().map(|d| d.id().to_string()).collect();
            for descriptor in descriptors {
                if let Err(e) = descriptor.validate() {
                    warn!("Rejecting descriptor: {}", e);
                    continue;
                }
                if !known.insert(descriptor.id().to_string()) {
                    debug!("Ignoring duplicate descriptor {}", descriptor.id());
                    continue;
                }
                accepted.push(descriptor);
            }
        }

        if accepted.is_empty() {
            return Ok(0);
        }

        let count = accepted.len();
        self.external.lock().extend(accepted.iter().cloned());
        let mut devices = self.devices.write();
        let mut next = devices.as_ref().clone();
        next.extend(accepted);
        *devices = Arc::new(dedupe(next));
        debug!("Ingested {} descriptor(s)", count);
        Ok(count)
    }

    /// Drain a descriptor stream until its sender closes
    pub async fn ingest_stream(&self, mut stream: mpsc::Receiver<DeviceDescriptor>) -> Result<usize> {
        let mut total = 0;
        while let Some(descriptor) = stream.recv().await {
            total += self.ingest(std::iter::once(descriptor))?;
        }
        Ok(total)
    }

    /// Current device snapshot
    pub fn devices(&self) -> Arc<Vec<DeviceDescriptor>> {
        Arc::clone(&self.devices.read())
    }

    pub fn find(&self, id: &str) -> Option<DeviceDescriptor> {
        self.devices.read().iter().find(|d| d.id() == id).cloned()
    }

    /// Driver responsible for `descriptor`
    ///
    /// An exact driver-hint match wins; otherwise the first driver whose
    /// `identify` accepts the descriptor.
    pub fn resolve(&self, descriptor: &DeviceDescriptor) -> Result<Arc<AnyDriver>> {
        if let Some(hint) = descriptor.driver_hint() {
            if let Some(driver) = self.drivers.iter().find(|d| d.name() == hint) {
                return Ok(Arc::clone(driver));
            }
        }
        self.drivers
            .iter()
            .find(|d| d.identify(descriptor))
            .cloned()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::IncompatibleDevice,
                    format!("no driver for {} ({} {})", descriptor.id(), descriptor.vendor(), descriptor.model()),
                )
            })
    }

    /// Open a session on `descriptor`
    pub async fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceSession> {
        self.ensure_running()?;
        let driver = self.resolve(descriptor)?;
        debug!("Resolved {} to {}", descriptor.id(), driver.name());

        let session = DeviceSession::new(driver, descriptor.clone(), self.session_config.clone());
        session.open().await?;
        Ok(session)
    }

    /// Open a session on a device from the snapshot
    pub async fn open_id(&self, id: &str) -> Result<DeviceSession> {
        let descriptor = self
            .find(id)
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound, format!("{id} not discovered")))?;
        self.open(&descriptor).await
    }

    /// Drop the snapshot and stop the emulation layer
    ///
    /// Further discovery and opens fail. Sessions still open keep their
    /// driver; emulated devices behind them are closed by the layer.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.devices.write() = Arc::new(Vec::new());
        self.external.lock().clear();
        if let Some(layer) = &self.emulation {
            layer.shutdown();
        }
        info!("Driver registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::new(ErrorKind::DeviceNotFound, "driver registry is shut down"));
        }
        Ok(())
    }
}

fn dedupe(devices: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| seen.insert(d.id().to_string()))
        .collect()
}
