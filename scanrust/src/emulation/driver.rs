//! Driver backed by the SANE emulation layer

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use scanrust_types::{
    CapabilityDescriptor, CapabilityFlags, ColorMode, DeviceDescriptor, ErrorKind,
    FrameParameters, OutputEncoding, ParameterValue, ScanArea, ScanParameters, ScanSource,
    VendorConstraint, VendorOption,
};
use tracing::{debug, instrument};

use super::device::{
    EMULATION_DRIVER_NAME, OPT_BR_X, OPT_BR_Y, OPT_BRIGHTNESS, OPT_CALIBRATE, OPT_DEPTH, OPT_MODE,
    OPT_PREVIEW, OPT_RESOLUTION, OPT_SOURCE, OPT_TL_X, OPT_TL_Y,
};
use super::option::{Fixed, OptionAction, OptionConstraint, OptionDescriptor, OptionInfo, OptionValue};
use super::stream::ReadStatus;
use super::{SaneEmulation, SaneHandle};
use crate::driver::{DriverKind, ReadOutcome, ScannerDriver};
use crate::error::{Error, Result};
use crate::handle::{DeviceHandle, HandleArena};

/// Smallest scan area the emulated devices accept, in millimetres
const MIN_AREA_MM: f64 = 1.0;

struct EmulatedDevice {
    sane: SaneHandle,
    capabilities: CapabilityDescriptor,
}

/// [`ScannerDriver`] over a shared [`SaneEmulation`]
pub struct EmulationDriver {
    layer: Arc<SaneEmulation>,
    devices: HandleArena<EmulatedDevice>,
}

impl EmulationDriver {
    pub fn new(layer: Arc<SaneEmulation>) -> Self {
        Self {
            layer,
            devices: HandleArena::new(),
        }
    }

    pub fn layer(&self) -> &Arc<SaneEmulation> {
        &self.layer
    }

    async fn sane_handle(&self, handle: &DeviceHandle) -> Result<SaneHandle> {
        Ok(self.devices.get(handle)?.lock().await.sane)
    }

    fn set(&self, sane: SaneHandle, index: usize, value: OptionValue) -> Result<()> {
        let (stored, info) = self
            .layer
            .control_option(sane, index, OptionAction::SetValue(value))?;
        if info.contains(OptionInfo::INEXACT) {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("option {index} cannot hold the requested value exactly, device chose {stored}"),
            ));
        }
        Ok(())
    }
}

/// Derive a capability descriptor from an option array
fn capabilities_from_options(options: &[OptionDescriptor]) -> Result<CapabilityDescriptor> {
    let option = |index: usize| {
        options.get(index).ok_or_else(|| {
            Error::new(ErrorKind::CommunicationError, format!("device lacks option {index}"))
        })
    };
    let words = |index: usize| -> Result<Vec<i32>> {
        match &option(index)?.constraint {
            OptionConstraint::WordList(words) => Ok(words.clone()),
            _ => Ok(Vec::new()),
        }
    };
    let strings = |index: usize| -> Result<Vec<String>> {
        match &option(index)?.constraint {
            OptionConstraint::StringList(items) => Ok(items.clone()),
            _ => Ok(Vec::new()),
        }
    };
    let max_mm = |index: usize| -> Result<f64> {
        match &option(index)?.constraint {
            OptionConstraint::FixedRange { max, .. } => Ok(max.to_f64()),
            _ => Ok(0.0),
        }
    };

    let resolutions: BTreeSet<u32> = words(OPT_RESOLUTION)?
        .into_iter()
        .filter_map(|r| u32::try_from(r).ok())
        .collect();
    let color_modes: BTreeSet<ColorMode> = strings(OPT_MODE)?
        .iter()
        .filter_map(|m| m.parse().ok())
        .collect();
    let mut bit_depths: BTreeSet<u8> = words(OPT_DEPTH)?
        .into_iter()
        .filter_map(|d| u8::try_from(d).ok())
        .collect();
    if color_modes.contains(&ColorMode::Lineart) {
        bit_depths.insert(1);
    }

    let sources: Vec<ScanSource> = strings(OPT_SOURCE)?
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    let mut flags = CapabilityFlags::empty();
    flags.set(CapabilityFlags::ADF, sources.contains(&ScanSource::Adf));
    flags.set(CapabilityFlags::DUPLEX, sources.contains(&ScanSource::AdfDuplex));
    flags.set(CapabilityFlags::PREVIEW, option(OPT_PREVIEW)?.is_active());
    flags.set(CapabilityFlags::CALIBRATION, option(OPT_CALIBRATE)?.is_active());

    let mut vendor_options = Vec::new();
    if let OptionConstraint::IntRange { min, max, quant } = option(OPT_BRIGHTNESS)?.constraint {
        vendor_options.push(VendorOption::new(
            option(OPT_BRIGHTNESS)?.name,
            ParameterValue::Int(0),
            VendorConstraint::IntRange {
                min: i64::from(min),
                max: i64::from(max),
                step: i64::from(quant.max(1)),
            },
        ));
    }

    Ok(CapabilityDescriptor {
        resolutions,
        color_modes,
        bit_depths,
        encodings: [OutputEncoding::Raw].into_iter().collect(),
        min_area: ScanArea::new(0.0, 0.0, MIN_AREA_MM, MIN_AREA_MM),
        max_area: ScanArea::new(0.0, 0.0, max_mm(OPT_BR_X)?, max_mm(OPT_BR_Y)?),
        flags,
        vendor_options,
    })
}

#[async_trait]
impl ScannerDriver for EmulationDriver {
    fn name(&self) -> &str {
        EMULATION_DRIVER_NAME
    }

    fn kind(&self) -> DriverKind {
        DriverKind::EmulationBacked
    }

    fn identify(&self, descriptor: &DeviceDescriptor) -> bool {
        descriptor.driver_hint() == Some(EMULATION_DRIVER_NAME) || self.layer.has_device(descriptor.id())
    }

    async fn discover(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.layer.list_devices(false))
    }

    #[instrument(skip(self, descriptor), fields(device = %descriptor.id()))]
    async fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle> {
        let sane = self.layer.open(descriptor.id())?;
        let capabilities = match self
            .layer
            .option_descriptors(sane)
            .and_then(|options| capabilities_from_options(&options))
        {
            Ok(capabilities) => capabilities,
            Err(e) => {
                let _ = self.layer.close(sane);
                return Err(e);
            }
        };

        let handle = self.devices.insert(EmulatedDevice { sane, capabilities });
        debug!("Opened {} as {}", descriptor.id(), handle);
        Ok(handle)
    }

    async fn capabilities(&self, handle: &DeviceHandle) -> Result<CapabilityDescriptor> {
        Ok(self.devices.get(handle)?.lock().await.capabilities.clone())
    }

    async fn apply_parameters(&self, handle: &DeviceHandle, params: &ScanParameters) -> Result<()> {
        let device = self.devices.get(handle)?;
        let device = device.lock().await;
        device.capabilities.validate(params)?;
        let sane = device.sane;

        self.set(sane, OPT_MODE, OptionValue::Text(params.color_mode.name().into()))?;
        if params.color_mode != ColorMode::Lineart {
            self.set(sane, OPT_DEPTH, OptionValue::Int(i32::from(params.bit_depth)))?;
        }
        self.set(sane, OPT_RESOLUTION, OptionValue::Int(params.resolution as i32))?;
        self.set(sane, OPT_SOURCE, OptionValue::Text(params.source.name().into()))?;
        if device.capabilities.flags.contains(CapabilityFlags::PREVIEW) {
            self.set(sane, OPT_PREVIEW, OptionValue::Bool(params.preview))?;
        }

        let area = &params.area;
        for (index, mm) in [
            (OPT_TL_X, area.left),
            (OPT_TL_Y, area.top),
            (OPT_BR_X, area.right),
            (OPT_BR_Y, area.bottom),
        ] {
            self.set(sane, index, OptionValue::Fixed(Fixed::from_f64(mm)))?;
        }

        match params.extensions.get("brightness").and_then(ParameterValue::as_int) {
            Some(level) => self.set(sane, OPT_BRIGHTNESS, OptionValue::Int(level as i32))?,
            None => {
                self.layer
                    .control_option(sane, OPT_BRIGHTNESS, OptionAction::SetAuto)?;
            }
        }

        Ok(())
    }

    async fn frame_parameters(&self, handle: &DeviceHandle) -> Result<FrameParameters> {
        let sane = self.sane_handle(handle).await?;
        self.layer.get_parameters(sane)
    }

    async fn start_scan(&self, handle: &DeviceHandle) -> Result<()> {
        let sane = self.sane_handle(handle).await?;
        self.layer.start(sane)
    }

    async fn read_chunk(&self, handle: &DeviceHandle, max_bytes: usize) -> Result<ReadOutcome> {
        let sane = self.sane_handle(handle).await?;
        let mut buf = BytesMut::zeroed(max_bytes);

        let (n, status) = self.layer.read(sane, &mut buf)?;
        match status {
            ReadStatus::Good => {
                buf.truncate(n);
                Ok(ReadOutcome::Data(buf.freeze()))
            }
            ReadStatus::EndOfFrame => Ok(ReadOutcome::EndOfFrame),
            ReadStatus::EndOfStream => Ok(ReadOutcome::EndOfStream),
            ReadStatus::Cancelled => Err(Error::new(ErrorKind::Cancelled, "scan cancelled")),
        }
    }

    async fn cancel_scan(&self, handle: &DeviceHandle) -> Result<()> {
        let sane = self.sane_handle(handle).await?;
        self.layer.cancel(sane)
    }

    async fn reset(&self, handle: &DeviceHandle) -> Result<()> {
        let sane = self.sane_handle(handle).await?;
        self.layer.reset(sane)
    }

    async fn close(&self, handle: DeviceHandle) -> Result<()> {
        let device = self.devices.remove(handle)?;
        let sane = device.lock().await.sane;
        self.layer.close(sane)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn driver() -> EmulationDriver {
        EmulationDriver::new(Arc::new(SaneEmulation::with_default_devices()))
    }

    fn descriptor(driver: &EmulationDriver, id: &str) -> DeviceDescriptor {
        driver
            .layer()
            .list_devices(false)
            .into_iter()
            .find(|d| d.id() == id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_capabilities_from_options() {
        let driver = driver();
        let handle = driver.open(&descriptor(&driver, "test:1")).await.unwrap();
        let caps = driver.capabilities(&handle).await.unwrap();

        assert_eq!(caps.resolutions, [150, 300].into_iter().collect());
        assert!(caps.color_modes.contains(&ColorMode::Lineart));
        assert!(caps.bit_depths.contains(&1));
        assert!(caps.flags.contains(CapabilityFlags::ADF | CapabilityFlags::DUPLEX));
        assert!(caps.vendor_option("brightness").is_some());
        assert!((caps.max_area.right - 215.9).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_identify_by_hint_or_name() {
        let driver = driver();
        assert!(driver.identify(&descriptor(&driver, "test:0")));

        let foreign = DeviceDescriptor::new(
            "usb:001:004",
            "Canon",
            "LiDE 110",
            scanrust_types::TransportKind::Usb,
            "usb:001:004",
        );
        assert!(!driver.identify(&foreign));
    }

    #[tokio::test]
    async fn test_apply_parameters_programs_options() {
        let driver = driver();
        let handle = driver.open(&descriptor(&driver, "test:0")).await.unwrap();

        let params = ScanParameters::new(300, ColorMode::Gray, ScanArea::new(0.0, 0.0, 32.0, 16.0));
        driver.apply_parameters(&handle, &params).await.unwrap();

        let layout = driver.frame_parameters(&handle).await.unwrap();
        assert_eq!(layout.pixels_per_line, 377);
        assert_eq!(layout.lines, 188);
        assert_eq!(layout.bytes_per_line, 377);
    }

    #[tokio::test]
    async fn test_apply_parameters_rejects_unsupported_resolution() {
        let driver = driver();
        let handle = driver.open(&descriptor(&driver, "test:0")).await.unwrap();

        let params = ScanParameters::new(200, ColorMode::Gray, ScanArea::new(0.0, 0.0, 10.0, 10.0));
        let err = driver.apply_parameters(&handle, &params).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_off_step_brightness_is_rejected_not_rounded() {
        let driver = driver();
        let handle = driver.open(&descriptor(&driver, "test:0")).await.unwrap();
        let sane = driver.sane_handle(&handle).await.unwrap();
        let base = ScanParameters::new(75, ColorMode::Gray, ScanArea::new(0.0, 0.0, 10.0, 10.0));

        let caps = driver.capabilities(&handle).await.unwrap();
        assert_eq!(
            caps.vendor_option("brightness").unwrap().constraint,
            VendorConstraint::IntRange { min: -100, max: 100, step: 5 }
        );

        let exact = base.clone().with_extension("brightness", ParameterValue::Int(10));
        driver.apply_parameters(&handle, &exact).await.unwrap();

        let off_step = base.with_extension("brightness", ParameterValue::Int(12));
        let err = driver.apply_parameters(&handle, &off_step).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let (held, _) = driver
            .layer()
            .control_option(sane, OPT_BRIGHTNESS, OptionAction::GetValue)
            .unwrap();
        assert_eq!(held, OptionValue::Int(10));

        let err = driver.set(sane, OPT_BRIGHTNESS, OptionValue::Int(12)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_read_chunk_until_end_of_stream() {
        let driver = driver();
        let handle = driver.open(&descriptor(&driver, "test:0")).await.unwrap();
        let params = ScanParameters::new(75, ColorMode::Gray, ScanArea::new(0.0, 0.0, 10.0, 10.0));
        driver.apply_parameters(&handle, &params).await.unwrap();

        let expected = driver.frame_parameters(&handle).await.unwrap().frame_bytes();
        driver.start_scan(&handle).await.unwrap();

        let mut total = 0u64;
        loop {
            match driver.read_chunk(&handle, 100).await.unwrap() {
                ReadOutcome::Data(bytes) => total += bytes.len() as u64,
                ReadOutcome::EndOfFrame => panic!("single-frame scan"),
                ReadOutcome::EndOfStream => break,
            }
        }
        assert_eq!(total, expected);
    }

    #[tokio::test]
    async fn test_cancel_surfaces_as_cancelled() {
        let driver = driver();
        let handle = driver.open(&descriptor(&driver, "test:0")).await.unwrap();
        driver.start_scan(&handle).await.unwrap();
        driver.cancel_scan(&handle).await.unwrap();

        let err = driver.read_chunk(&handle, 64).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_close_releases_device() {
        let driver = driver();
        let desc = descriptor(&driver, "test:0");
        let handle = driver.open(&desc).await.unwrap();

        assert_eq!(driver.open(&desc).await.unwrap_err().kind(), ErrorKind::DeviceBusy);
        driver.close(handle).await.unwrap();
        assert!(driver.open(&desc).await.is_ok());
    }
}
