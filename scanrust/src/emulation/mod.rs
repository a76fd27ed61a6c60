//! In-process SANE protocol emulation
//!
//! Implements the three SANE sub-protocols against an in-memory device
//! table:
//! - device directory (`list_devices`, `open`, `close`)
//! - option control (`control_option` with get, set and auto)
//! - scan streaming (`get_parameters`, `start`, `read`, `cancel`)
//!
//! The table has its own lock, independent of any session lock, so a slow
//! scan never blocks an unrelated directory query.

mod device;
mod driver;
mod option;
mod stream;

pub use device::{OptionSet, VirtualDeviceSpec, EMULATION_DRIVER_NAME, NUM_OPTIONS, OPT_NUM_OPTS};
pub use driver::EmulationDriver;
pub use option::{
    Fixed, OptionAction, OptionCapabilities, OptionConstraint, OptionDescriptor, OptionInfo,
    OptionUnit, OptionValue, OptionValueType,
};
pub use stream::ReadStatus;

use std::collections::HashMap;
use std::fmt;

use scanrust_types::{DeviceDescriptor, ErrorKind, FrameParameters, ScanSource};
use tracing::{debug, info};

use crate::error::{Error, Result};
use device::OPT_CALIBRATE;
use stream::ScanStream;

/// Handle to a device opened in the emulation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaneHandle(u32);

impl fmt::Display for SaneHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sane#{}", self.0)
    }
}

struct DeviceEntry {
    spec: VirtualDeviceSpec,
    feeder_pages: u32,
    calibrations: u32,
}

struct OpenDevice {
    device: usize,
    options: OptionSet,
    cached: Option<FrameParameters>,
    stream: Option<ScanStream>,
}

impl OpenDevice {
    /// A scan is running and has not been cancelled
    fn scanning(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| !s.is_cancelled())
    }

    fn planned_frames(&self, entry: &DeviceEntry) -> u32 {
        match self.options.source() {
            ScanSource::Flatbed => 1,
            source => entry.feeder_pages * source.sides(),
        }
    }
}

#[derive(Default)]
struct EmulationState {
    devices: Vec<DeviceEntry>,
    open: HashMap<SaneHandle, OpenDevice>,
    next_handle: u32,
    shut_down: bool,
}

impl EmulationState {
    fn open_device(&mut self, handle: SaneHandle) -> Result<&mut OpenDevice> {
        self.open
            .get_mut(&handle)
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound, format!("{handle} is not open")))
    }

    fn entry(&mut self, name: &str) -> Result<&mut DeviceEntry> {
        self.devices
            .iter_mut()
            .find(|d| d.spec.name == name)
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound, format!("no device named {name}")))
    }
}

/// Software SANE backend
pub struct SaneEmulation {
    state: parking_lot::Mutex<EmulationState>,
}

impl SaneEmulation {
    /// Create a layer serving `specs`
    pub fn new(specs: impl IntoIterator<Item = VirtualDeviceSpec>) -> Self {
        let devices = specs
            .into_iter()
            .map(|spec| DeviceEntry {
                feeder_pages: spec.adf_pages,
                calibrations: 0,
                spec,
            })
            .collect();

        Self {
            state: parking_lot::Mutex::new(EmulationState {
                devices,
                ..Default::default()
            }),
        }
    }

    /// Layer serving [`VirtualDeviceSpec::defaults`]
    pub fn with_default_devices() -> Self {
        Self::new(VirtualDeviceSpec::defaults())
    }

    /// Add a device to the table
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if a device with the same name exists.
    pub fn add_device(&self, spec: VirtualDeviceSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.devices.iter().any(|d| d.spec.name == spec.name) {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("device {} already exists", spec.name),
            ));
        }
        state.devices.push(DeviceEntry {
            feeder_pages: spec.adf_pages,
            calibrations: 0,
            spec,
        });
        Ok(())
    }

    /// Device directory
    pub fn list_devices(&self, local_only: bool) -> Vec<DeviceDescriptor> {
        let state = self.state.lock();
        if state.shut_down {
            return Vec::new();
        }
        state
            .devices
            .iter()
            .filter(|d| !local_only || d.spec.is_local())
            .map(|d| d.spec.descriptor())
            .collect()
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.state.lock().devices.iter().any(|d| d.spec.name == name)
    }

    /// Open a device by name
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` for unknown names, `DeviceBusy` if already open.
    pub fn open(&self, name: &str) -> Result<SaneHandle> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Err(Error::new(ErrorKind::DeviceNotFound, "emulation layer shut down"));
        }

        let device = state
            .devices
            .iter()
            .position(|d| d.spec.name == name)
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound, format!("no device named {name}")))?;

        if state.open.values().any(|o| o.device == device) {
            return Err(Error::new(
                ErrorKind::DeviceBusy,
                format!("{name} is already open"),
            ));
        }

        let handle = SaneHandle(state.next_handle);
        state.next_handle = state.next_handle.wrapping_add(1);
        let options = OptionSet::build(&state.devices[device].spec);
        state.open.insert(
            handle,
            OpenDevice {
                device,
                options,
                cached: None,
                stream: None,
            },
        );

        debug!("Opened {} as {}", name, handle);
        Ok(handle)
    }

    /// Close a device, abandoning any running scan
    pub fn close(&self, handle: SaneHandle) -> Result<()> {
        let mut state = self.state.lock();
        state
            .open
            .remove(&handle)
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound, format!("{handle} is not open")))?;
        debug!("Closed {}", handle);
        Ok(())
    }

    /// Ordered option descriptors; index 0 is the option count
    pub fn option_descriptors(&self, handle: SaneHandle) -> Result<Vec<OptionDescriptor>> {
        let mut state = self.state.lock();
        Ok(state.open_device(handle)?.options.descriptors().to_vec())
    }

    /// Look up an option index by name
    pub fn option_index(&self, handle: SaneHandle, name: &str) -> Result<usize> {
        let mut state = self.state.lock();
        state
            .open_device(handle)?
            .options
            .index_of(name)
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, format!("no option {name}")))
    }

    /// Option-control protocol
    ///
    /// Returns the option value after the action and the side effects of a
    /// set. Setting options while a scan is running is `DeviceBusy`.
    pub fn control_option(
        &self,
        handle: SaneHandle,
        index: usize,
        action: OptionAction,
    ) -> Result<(OptionValue, OptionInfo)> {
        let mut state = self.state.lock();
        let open = state.open_device(handle)?;

        if matches!(action, OptionAction::GetValue) {
            return Ok((open.options.get(index)?, OptionInfo::empty()));
        }
        if open.scanning() {
            return Err(Error::new(
                ErrorKind::DeviceBusy,
                "options cannot change while scanning",
            ));
        }

        let info = match action {
            OptionAction::GetValue => OptionInfo::empty(),
            OptionAction::SetValue(_) if index == OPT_CALIBRATE => {
                if !open.options.calibration_supported() {
                    return Err(Error::not_supported("calibration"));
                }
                let device = open.device;
                state.devices[device].calibrations += 1;
                return Ok((OptionValue::None, OptionInfo::empty()));
            }
            OptionAction::SetValue(value) => open.options.set(index, value)?,
            OptionAction::SetAuto => open.options.set_auto(index)?,
        };

        open.cached = None;
        let value = open.options.get(index)?;
        Ok((value, info))
    }

    /// Frame parameters
    ///
    /// While scanning, the layout of the current frame. Otherwise the
    /// layout the next scan's first frame will have, computed on first
    /// request and kept until an option changes.
    pub fn get_parameters(&self, handle: SaneHandle) -> Result<FrameParameters> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let open = state
            .open
            .get_mut(&handle)
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound, format!("{handle} is not open")))?;

        if let Some(layout) = open
            .stream
            .as_ref()
            .filter(|s| !s.is_cancelled())
            .and_then(|s| s.current_layout())
        {
            return Ok(layout);
        }
        if let Some(layout) = open.cached {
            return Ok(layout);
        }

        let frames = open.planned_frames(&state.devices[open.device]);
        let layout = open.options.frame_parameters(frames <= 1);
        open.cached = Some(layout);
        Ok(layout)
    }

    /// Whether frame parameters are currently cached
    pub fn parameters_cached(&self, handle: SaneHandle) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(state.open_device(handle)?.cached.is_some())
    }

    /// Start a scan
    ///
    /// # Errors
    ///
    /// `DeviceBusy` if a scan is running, `DeviceNotReady` if a feeder
    /// source is selected and the feeder is empty.
    pub fn start(&self, handle: SaneHandle) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let open = state
            .open
            .get_mut(&handle)
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotFound, format!("{handle} is not open")))?;

        // A cancelled stream whose status was never read does not block a restart
        if open.scanning() {
            return Err(Error::new(ErrorKind::DeviceBusy, "scan already running"));
        }

        let entry = &mut state.devices[open.device];
        let frames = open.planned_frames(entry);
        if frames == 0 {
            return Err(Error::new(ErrorKind::DeviceNotReady, "document feeder is empty"));
        }
        if open.options.source() != ScanSource::Flatbed {
            entry.feeder_pages = 0;
        }

        let layouts = (0..frames)
            .map(|i| open.options.frame_parameters(i + 1 == frames))
            .collect();
        open.stream = Some(ScanStream::new(layouts));

        info!(
            "Started scan on {} ({} frame(s), {})",
            entry.spec.name,
            frames,
            open.options.source()
        );
        Ok(())
    }

    /// Streaming read
    ///
    /// Never blocks. After `EndOfStream` or `Cancelled` the scan is over.
    pub fn read(&self, handle: SaneHandle, buf: &mut [u8]) -> Result<(usize, ReadStatus)> {
        let mut state = self.state.lock();
        let open = state.open_device(handle)?;
        let stream = open.stream.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::ScanNotInProgress, "read without a running scan")
        })?;

        let (n, status) = stream.read(buf);
        if matches!(status, ReadStatus::EndOfStream | ReadStatus::Cancelled) {
            open.stream = None;
        }
        Ok((n, status))
    }

    /// Cancel the running scan; safe at any time
    pub fn cancel(&self, handle: SaneHandle) -> Result<()> {
        let mut state = self.state.lock();
        let open = state.open_device(handle)?;
        if let Some(stream) = open.stream.as_mut() {
            debug!("Cancelling scan on {}", handle);
            stream.cancel();
        }
        Ok(())
    }

    /// Drop any scan state and cached parameters
    pub fn reset(&self, handle: SaneHandle) -> Result<()> {
        let mut state = self.state.lock();
        let open = state.open_device(handle)?;
        open.stream = None;
        open.cached = None;
        Ok(())
    }

    pub fn is_scanning(&self, handle: SaneHandle) -> Result<bool> {
        let mut state = self.state.lock();
        Ok(state.open_device(handle)?.scanning())
    }

    /// Load sheets into a device's feeder
    ///
    /// # Errors
    ///
    /// `NotSupported` if the device has no feeder.
    pub fn load_feeder(&self, name: &str, pages: u32) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.entry(name)?;
        if !entry.spec.sources.contains(&ScanSource::Adf) {
            return Err(Error::not_supported(format!("{name} has no document feeder")));
        }
        entry.feeder_pages = pages;
        Ok(())
    }

    pub fn feeder_pages(&self, name: &str) -> Result<u32> {
        let mut state = self.state.lock();
        Ok(state.entry(name)?.feeder_pages)
    }

    /// Calibration button presses on a device
    pub fn calibrations(&self, name: &str) -> Result<u32> {
        let mut state = self.state.lock();
        Ok(state.entry(name)?.calibrations)
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Close every open device and refuse further opens
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let closed = state.open.len();
        state.open.clear();
        state.shut_down = true;
        info!("Emulation layer shut down ({} device(s) closed)", closed);
    }
}

impl Default for SaneEmulation {
    fn default() -> Self {
        Self::with_default_devices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use device::{OPT_BR_X, OPT_BR_Y, OPT_BRIGHTNESS, OPT_RESOLUTION, OPT_SOURCE};

    fn read_all(layer: &SaneEmulation, handle: SaneHandle) -> (Vec<Vec<u8>>, ReadStatus) {
        let mut frames = vec![Vec::new()];
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, status) = layer.read(handle, &mut buf).unwrap();
            frames.last_mut().unwrap().extend_from_slice(&buf[..n]);
            match status {
                ReadStatus::Good => {}
                ReadStatus::EndOfFrame => frames.push(Vec::new()),
                other => return (frames, other),
            }
        }
    }

    #[test]
    fn test_list_devices_local_only() {
        let layer = SaneEmulation::with_default_devices();
        assert_eq!(layer.list_devices(false).len(), 3);

        let local = layer.list_devices(true);
        assert_eq!(local.len(), 2);
        assert!(local.iter().all(|d| d.id() != "net:scanner.lan"));
    }

    #[test]
    fn test_open_is_exclusive() {
        let layer = SaneEmulation::with_default_devices();
        let handle = layer.open("test:0").unwrap();

        let err = layer.open("test:0").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);

        layer.close(handle).unwrap();
        assert!(layer.open("test:0").is_ok());
        assert_eq!(layer.open("nope").unwrap_err().kind(), ErrorKind::DeviceNotFound);
    }

    #[test]
    fn test_parameters_cached_until_set() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();

        assert!(!layer.parameters_cached(h).unwrap());
        let before = layer.get_parameters(h).unwrap();
        assert!(layer.parameters_cached(h).unwrap());

        let (_, info) = layer
            .control_option(h, OPT_RESOLUTION, OptionAction::SetValue(OptionValue::Int(300)))
            .unwrap();
        assert!(info.contains(OptionInfo::RELOAD_PARAMS));
        assert!(!layer.parameters_cached(h).unwrap());

        let after = layer.get_parameters(h).unwrap();
        assert!(after.pixels_per_line > before.pixels_per_line);
    }

    #[test]
    fn test_set_value_rejects_out_of_range() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();

        let err = layer
            .control_option(h, OPT_RESOLUTION, OptionAction::SetValue(OptionValue::Int(200)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let (value, _) = layer.control_option(h, OPT_RESOLUTION, OptionAction::GetValue).unwrap();
        assert_eq!(value, OptionValue::Int(150));
    }

    #[test]
    fn test_inexact_brightness() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();

        let (value, info) = layer
            .control_option(h, OPT_BRIGHTNESS, OptionAction::SetValue(OptionValue::Int(12)))
            .unwrap();
        assert_eq!(value, OptionValue::Int(10));
        assert!(info.contains(OptionInfo::INEXACT));
    }

    #[test]
    fn test_flatbed_scan_streams_declared_bytes() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();
        layer
            .control_option(h, OPT_BR_X, OptionAction::SetValue(OptionValue::Fixed(Fixed::from_f64(25.4))))
            .unwrap();
        layer
            .control_option(h, OPT_BR_Y, OptionAction::SetValue(OptionValue::Fixed(Fixed::from_f64(10.0))))
            .unwrap();

        let layout = layer.get_parameters(h).unwrap();
        layer.start(h).unwrap();
        let (frames, status) = read_all(&layer, h);

        assert_eq!(status, ReadStatus::EndOfStream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len() as u64, layout.frame_bytes());
        assert!(!layer.is_scanning(h).unwrap());
    }

    #[test]
    fn test_duplex_feeder_yields_frame_per_side() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:1").unwrap();
        let source = layer.option_index(h, "source").unwrap();
        assert_eq!(source, OPT_SOURCE);
        layer
            .control_option(h, source, OptionAction::SetValue(OptionValue::Text("ADF Duplex".into())))
            .unwrap();
        layer
            .control_option(h, OPT_BR_Y, OptionAction::SetValue(OptionValue::Fixed(Fixed::from_f64(5.0))))
            .unwrap();

        assert!(!layer.get_parameters(h).unwrap().last_frame);
        layer.start(h).unwrap();
        let (frames, status) = read_all(&layer, h);
        assert_eq!(status, ReadStatus::EndOfStream);
        assert_eq!(frames.len(), 4);

        assert_eq!(layer.feeder_pages("test:1").unwrap(), 0);
        assert_eq!(layer.start(h).unwrap_err().kind(), ErrorKind::DeviceNotReady);

        layer.load_feeder("test:1", 1).unwrap();
        assert!(layer.start(h).is_ok());
    }

    #[test]
    fn test_cancel_mid_read() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();
        layer.start(h).unwrap();

        let mut buf = [0u8; 128];
        assert_eq!(layer.read(h, &mut buf).unwrap(), (128, ReadStatus::Good));
        layer.cancel(h).unwrap();
        assert_eq!(layer.read(h, &mut buf).unwrap(), (0, ReadStatus::Cancelled));
        assert_eq!(
            layer.read(h, &mut buf).unwrap_err().kind(),
            ErrorKind::ScanNotInProgress
        );
    }

    #[test]
    fn test_restart_after_cancel_without_read() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();
        layer.start(h).unwrap();
        layer.cancel(h).unwrap();

        assert!(!layer.is_scanning(h).unwrap());
        layer
            .control_option(h, OPT_RESOLUTION, OptionAction::SetValue(OptionValue::Int(150)))
            .unwrap();
        layer.start(h).unwrap();
        assert!(layer.is_scanning(h).unwrap());
    }

    #[test]
    fn test_options_locked_while_scanning() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();
        layer.start(h).unwrap();

        let err = layer
            .control_option(h, OPT_RESOLUTION, OptionAction::SetValue(OptionValue::Int(300)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);
        assert!(layer.control_option(h, OPT_RESOLUTION, OptionAction::GetValue).is_ok());
    }

    #[test]
    fn test_calibrate_button() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();
        layer
            .control_option(h, OPT_CALIBRATE, OptionAction::SetValue(OptionValue::None))
            .unwrap();
        assert_eq!(layer.calibrations("test:0").unwrap(), 1);

        let remote = layer.open("net:scanner.lan").unwrap();
        let err = layer
            .control_option(remote, OPT_CALIBRATE, OptionAction::SetValue(OptionValue::None))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let layer = SaneEmulation::with_default_devices();
        let h = layer.open("test:0").unwrap();
        layer.shutdown();

        assert_eq!(layer.open_count(), 0);
        assert!(layer.get_parameters(h).is_err());
        assert!(layer.open("test:0").is_err());
        assert!(layer.list_devices(false).is_empty());
    }
}
