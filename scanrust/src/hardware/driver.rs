//! Driver backed by a chipset register protocol

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use scanrust_core::chipset::ChipsetInfo;
use scanrust_core::ChipsetKind;
use scanrust_types::{
    CapabilityDescriptor, CapabilityFlags, ColorMode, DeviceDescriptor, ErrorKind,
    FrameParameters, OutputEncoding, ParameterValue, ScanArea, ScanParameters, VendorConstraint,
    VendorOption,
};
use tracing::{debug, info, instrument, warn};

use super::adapter::ProtocolAdapter;
use super::connector::Connector;
use crate::config::AdapterConfig;
use crate::driver::{DriverKind, ReadOutcome, ScannerDriver};
use crate::error::{Error, Result};
use crate::handle::{DeviceHandle, HandleArena};

/// Analog front-end gain extension
pub const GAIN_OPTION: &str = "gain";
/// Analog front-end offset extension
pub const OFFSET_OPTION: &str = "offset";

const DEFAULT_GAIN: u8 = 16;
const DEFAULT_OFFSET: u8 = 128;
const MAX_GAIN: i64 = 63;
const MIN_AREA_MM: f64 = 1.0;

/// Driver name for a chipset, as carried in descriptor hints
pub fn driver_name(chipset: ChipsetKind) -> String {
    format!("chipset:{}", chipset.name())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Idle,
    Running,
    /// Device reported end of data; stop not yet sent
    Drained,
}

struct HardwareDevice {
    id: String,
    adapter: ProtocolAdapter,
    info: &'static ChipsetInfo,
    capabilities: CapabilityDescriptor,
    params: Option<ScanParameters>,
    calibrated: HashSet<u32>,
    phase: ScanPhase,
}

impl HardwareDevice {
    fn effective_params(&self) -> ScanParameters {
        self.params
            .clone()
            .unwrap_or_else(|| self.capabilities.default_parameters())
    }

    async fn program(&mut self, params: &ScanParameters) -> Result<()> {
        let gain = extension_u8(params, GAIN_OPTION).unwrap_or(DEFAULT_GAIN);
        let offset = extension_u8(params, OFFSET_OPTION).unwrap_or(DEFAULT_OFFSET);
        self.adapter.configure(params, gain, offset).await
    }
}

fn extension_u8(params: &ScanParameters, name: &str) -> Option<u8> {
    params
        .extensions
        .get(name)
        .and_then(ParameterValue::as_int)
        .and_then(|v| u8::try_from(v).ok())
}

/// Capability descriptor for a chipset table entry
pub fn chipset_capabilities(info: &ChipsetInfo) -> CapabilityDescriptor {
    let mut bit_depths: BTreeSet<u8> = info.depths.iter().copied().collect();
    bit_depths.insert(1);

    let mut flags = CapabilityFlags::empty();
    flags.set(CapabilityFlags::CALIBRATION, info.calibration);
    flags.set(CapabilityFlags::PREVIEW, info.preview);

    CapabilityDescriptor {
        resolutions: info.resolutions.iter().copied().collect(),
        color_modes: ColorMode::ALL.into_iter().collect(),
        bit_depths,
        encodings: [OutputEncoding::Raw].into_iter().collect(),
        min_area: ScanArea::new(0.0, 0.0, MIN_AREA_MM, MIN_AREA_MM),
        max_area: ScanArea::new(0.0, 0.0, info.max_width_mm, info.max_height_mm),
        flags,
        vendor_options: vec![
            VendorOption::new(
                GAIN_OPTION,
                ParameterValue::Int(i64::from(DEFAULT_GAIN)),
                VendorConstraint::IntRange { min: 0, max: MAX_GAIN, step: 1 },
            ),
            VendorOption::new(
                OFFSET_OPTION,
                ParameterValue::Int(i64::from(DEFAULT_OFFSET)),
                VendorConstraint::IntRange { min: 0, max: 255, step: 1 },
            ),
        ],
    }
}

/// Exclusive claim on a device id while an open is in flight
///
/// Released on drop unless committed, so a failed or abandoned open never
/// leaves the device marked busy.
struct Reservation<'a> {
    ids: &'a parking_lot::Mutex<HashSet<String>>,
    id: String,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn claim(ids: &'a parking_lot::Mutex<HashSet<String>>, id: &str) -> Result<Self> {
        if !ids.lock().insert(id.to_string()) {
            return Err(Error::new(ErrorKind::DeviceBusy, format!("{id} is already open")));
        }
        Ok(Self {
            ids,
            id: id.to_string(),
            committed: false,
        })
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ids.lock().remove(&self.id);
        }
    }
}

/// [`ScannerDriver`] for one chipset family
///
/// Each open device gets its own [`ProtocolAdapter`] over a transport from
/// the [`Connector`].
pub struct HardwareDriver {
    chipset: ChipsetKind,
    name: String,
    connector: Arc<dyn Connector>,
    config: AdapterConfig,
    devices: HandleArena<HardwareDevice>,
    open_ids: parking_lot::Mutex<HashSet<String>>,
}

impl HardwareDriver {
    pub fn new(chipset: ChipsetKind, connector: Arc<dyn Connector>) -> Self {
        Self {
            chipset,
            name: driver_name(chipset),
            connector,
            config: AdapterConfig::default(),
            devices: HandleArena::new(),
            open_ids: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    pub fn with_adapter_config(mut self, config: AdapterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn chipset(&self) -> ChipsetKind {
        self.chipset
    }

    /// Connect, identify and initialize; cleans up after itself on failure
    async fn bring_up(&self, descriptor: &DeviceDescriptor) -> Result<HardwareDevice> {
        let transport = self.connector.connect(descriptor).await?;
        let mut adapter = ProtocolAdapter::new(transport, self.config.clone());

        let info = match adapter.identify().await {
            Ok(info) if info.kind == self.chipset => info,
            Ok(info) => {
                let _ = adapter.disconnect().await;
                return Err(scanrust_core::Error::ChipsetMismatch {
                    expected: self.chipset.name(),
                    found: info.name,
                }
                .into());
            }
            Err(e) => {
                let _ = adapter.disconnect().await;
                return Err(e);
            }
        };

        if let Err(e) = adapter.initialize().await {
            warn!("{}: initialization failed, resetting: {}", descriptor.id(), e);
            if let Err(reset_err) = adapter.reset().await {
                debug!("Reset after failed init: {}", reset_err);
            }
            let _ = adapter.disconnect().await;
            return Err(e);
        }

        Ok(HardwareDevice {
            id: descriptor.id().to_string(),
            adapter,
            info,
            capabilities: chipset_capabilities(info),
            params: None,
            calibrated: HashSet::new(),
            phase: ScanPhase::Idle,
        })
    }
}

#[async_trait]
impl ScannerDriver for HardwareDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DriverKind {
        DriverKind::HardwareProtocolBacked(self.chipset)
    }

    fn identify(&self, descriptor: &DeviceDescriptor) -> bool {
        match descriptor.driver_hint() {
            Some(hint) => hint == self.name || hint == self.chipset.name(),
            None => self.chipset.info().matches_model(descriptor.model()),
        }
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        self.connector.enumerate(self.chipset).await
    }

    #[instrument(skip(self, descriptor), fields(device = %descriptor.id()))]
    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle> {
        let reservation = Reservation::claim(&self.open_ids, descriptor.id())?;
        let device = self.bring_up(descriptor).await?;
        reservation.commit();

        info!("Opened {} ({})", descriptor.id(), device.info.name);
        Ok(self.devices.insert(device))
    }

    async fn capabilities(&self, handle: &DeviceHandle) -> Result<CapabilityDescriptor> {
        Ok(self.devices.get(handle)?.lock().await.capabilities.clone())
    }

    async fn apply_parameters(&self, handle: &DeviceHandle, params: &ScanParameters) -> Result<()> {
        let device = self.devices.get(handle)?;
        let mut device = device.lock().await;
        if device.phase != ScanPhase::Idle {
            return Err(Error::new(ErrorKind::ScanInProgress, "cannot reconfigure while scanning"));
        }
        device.capabilities.validate(params)?;
        device.program(params).await?;
        device.params = Some(params.clone());
        Ok(())
    }

    async fn frame_parameters(&self, handle: &DeviceHandle) -> Result<FrameParameters> {
        let device = self.devices.get(handle)?;
        let device = device.lock().await;
        Ok(FrameParameters::for_parameters(&device.effective_params(), true))
    }

    async fn start_scan(&self, handle: &DeviceHandle) -> Result<()> {
        let device = self.devices.get(handle)?;
        let mut device = device.lock().await;
        if device.phase != ScanPhase::Idle {
            return Err(Error::new(ErrorKind::DeviceBusy, "scan already running"));
        }

        if device.params.is_none() {
            let defaults = device.capabilities.default_parameters();
            device.program(&defaults).await?;
            device.params = Some(defaults);
        }

        let resolution = device.effective_params().resolution;
        if device.info.calibration && !device.calibrated.contains(&resolution) {
            device.adapter.calibrate().await?;
            device.calibrated.insert(resolution);
            // Calibration moves the carriage and rewrites the geometry.
            let params = device.effective_params();
            device.program(&params).await?;
        }

        device.adapter.start_scan().await?;
        device.phase = ScanPhase::Running;
        debug!("{}: scan started at {} dpi", device.id, resolution);
        Ok(())
    }

    async fn read_chunk(&self, handle: &DeviceHandle, max_bytes: usize) -> Result<ReadOutcome> {
        let device = self.devices.get(handle)?;
        let mut device = device.lock().await;

        match device.phase {
            ScanPhase::Idle => Err(Error::new(ErrorKind::ScanNotInProgress, "no scan running")),
            ScanPhase::Drained => {
                device.phase = ScanPhase::Idle;
                device.adapter.stop_scan().await?;
                Ok(ReadOutcome::EndOfStream)
            }
            ScanPhase::Running => {
                let chunk = device.adapter.read_data(max_bytes).await?;
                if chunk.done {
                    device.phase = ScanPhase::Drained;
                }
                if chunk.data.is_empty() && chunk.done {
                    device.phase = ScanPhase::Idle;
                    device.adapter.stop_scan().await?;
                    return Ok(ReadOutcome::EndOfStream);
                }
                Ok(ReadOutcome::Data(chunk.data))
            }
        }
    }

    async fn cancel_scan(&self, handle: &DeviceHandle) -> Result<()> {
        let device = self.devices.get(handle)?;
        let mut device = device.lock().await;
        if device.phase == ScanPhase::Idle && !device.adapter.lamp_is_on() {
            return Ok(());
        }
        device.phase = ScanPhase::Idle;
        device.adapter.stop_scan().await
    }

    async fn reset(&self, handle: &DeviceHandle) -> Result<()> {
        let device = self.devices.get(handle)?;
        let mut device = device.lock().await;
        device.phase = ScanPhase::Idle;
        device.adapter.reset().await?;
        device.adapter.initialize().await?;
        if let Some(params) = device.params.clone() {
            device.program(&params).await?;
        }
        Ok(())
    }

    async fn close(&self, handle: DeviceHandle) -> Result<()> {
        let device = self.devices.remove(handle)?;
        let mut device = device.lock().await;

        if device.phase != ScanPhase::Idle {
            if let Err(e) = device.adapter.stop_scan().await {
                warn!("{}: stop on close failed: {}", device.id, e);
            }
        }
        if let Err(e) = device.adapter.disconnect().await {
            warn!("{}: disconnect failed: {}", device.id, e);
        }

        self.open_ids.lock().remove(&device.id);
        info!("Closed {}", device.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use crate::hardware::simulator::{SimulatedConnector, SimulatedScanner};

    fn fast_config() -> AdapterConfig {
        AdapterConfig::default()
            .with_response_timeout(Duration::from_millis(50))
            .with_ready_timeout(Duration::from_millis(50))
    }

    fn rig(scanner: SimulatedScanner) -> (HardwareDriver, DeviceDescriptor) {
        let kind = scanner.chipset();
        let connector = SimulatedConnector::new();
        let desc = connector.attach("sim0", scanner);
        let driver = HardwareDriver::new(kind, Arc::new(connector)).with_adapter_config(fast_config());
        (driver, desc)
    }

    #[tokio::test]
    async fn test_open_identifies_and_initializes() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841);
        let (driver, desc) = rig(sim.clone());

        assert!(driver.identify(&desc));
        let handle = driver.open(&desc).await.unwrap();
        let init = ChipsetKind::Gl841.info().init_sequence;
        let writes = sim.register_writes();
        assert_eq!(writes.len(), init.len());
        assert_eq!(writes[0], (init[0].0, u16::from(init[0].1)));

        let caps = driver.capabilities(&handle).await.unwrap();
        assert!(caps.resolutions.contains(&1200));
        assert!(caps.vendor_option(GAIN_OPTION).is_some());
    }

    #[tokio::test]
    async fn test_unknown_chip_is_incompatible_without_writes() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841).with_chip_id(0xBEEF);
        let (driver, desc) = rig(sim.clone());

        let err = driver.open(&desc).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleDevice);
        assert!(sim.register_writes().is_empty());
    }

    #[tokio::test]
    async fn test_other_chipset_is_incompatible() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841).with_chip_id(0x9831);
        let (driver, desc) = rig(sim.clone());

        let err = driver.open(&desc).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleDevice);
        assert!(sim.register_writes().is_empty());
    }

    #[tokio::test]
    async fn test_never_ready_is_initialization_error() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl846).never_ready();
        let (driver, desc) = rig(sim.clone());

        let err = driver.open(&desc).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InitializationError);
        assert_eq!(sim.resets(), 1);
        assert!(!sim.lamp_on());

        // The failed open released the id
        let again = driver.open(&desc).await.unwrap_err();
        assert_eq!(again.kind(), ErrorKind::InitializationError);
    }

    #[tokio::test]
    async fn test_double_open_is_busy() {
        let (driver, desc) = rig(SimulatedScanner::new(ChipsetKind::Rts8822));
        let handle = driver.open(&desc).await.unwrap();

        assert_eq!(driver.open(&desc).await.unwrap_err().kind(), ErrorKind::DeviceBusy);
        driver.close(handle).await.unwrap();
        assert!(driver.open(&desc).await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_reads_declared_bytes() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841);
        let (driver, desc) = rig(sim.clone());
        let handle = driver.open(&desc).await.unwrap();

        let params = ScanParameters::new(150, ColorMode::Gray, ScanArea::new(0.0, 0.0, 50.0, 20.0))
            .with_extension(GAIN_OPTION, ParameterValue::Int(40));
        driver.apply_parameters(&handle, &params).await.unwrap();
        assert_eq!(sim.register(ChipsetKind::Gl841.info().registers.gain), Some(40));

        let expected = driver.frame_parameters(&handle).await.unwrap().frame_bytes();
        driver.start_scan(&handle).await.unwrap();
        assert_eq!(sim.calibrations(), 2);
        assert!(sim.lamp_on());

        let mut total = 0u64;
        loop {
            match driver.read_chunk(&handle, 4096).await.unwrap() {
                ReadOutcome::Data(bytes) => total += bytes.len() as u64,
                ReadOutcome::EndOfFrame => unreachable!(),
                ReadOutcome::EndOfStream => break,
            }
        }
        assert_eq!(total, expected);
        assert!(!sim.lamp_on());

        // Same resolution: no second calibration
        driver.start_scan(&handle).await.unwrap();
        assert_eq!(sim.calibrations(), 2);
        driver.cancel_scan(&handle).await.unwrap();
        assert!(!sim.lamp_on());
    }

    #[tokio::test]
    async fn test_calibration_failure_turns_lamp_off() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl843).fail_calibration();
        let (driver, desc) = rig(sim.clone());
        let handle = driver.open(&desc).await.unwrap();

        let err = driver.start_scan(&handle).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CalibrationError);
        assert!(!sim.lamp_on());
        assert!(!sim.is_scanning());
    }

    #[tokio::test]
    async fn test_invalid_gain_rejected() {
        let (driver, desc) = rig(SimulatedScanner::new(ChipsetKind::Lm9831));
        let handle = driver.open(&desc).await.unwrap();

        let params = ScanParameters::new(300, ColorMode::Color, ScanArea::new(0.0, 0.0, 10.0, 10.0))
            .with_extension(GAIN_OPTION, ParameterValue::Int(64));
        let err = driver.apply_parameters(&handle, &params).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }
}
