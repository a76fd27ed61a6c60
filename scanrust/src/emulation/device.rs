//! Virtual devices and their option arrays

use scanrust_types::{
    ColorMode, DeviceDescriptor, ErrorKind, FrameParameters, ScanArea, ScanSource, TransportKind,
    mm_to_pixels,
};

use super::option::{
    constrain, Fixed, OptionCapabilities, OptionConstraint, OptionDescriptor, OptionInfo,
    OptionUnit, OptionValue, OptionValueType,
};
use crate::error::{Error, Result};

/// Driver hint carried by every emulated descriptor
pub const EMULATION_DRIVER_NAME: &str = "sane-emulation";

/// Index of the read-only option holding the option count
pub const OPT_NUM_OPTS: usize = 0;
pub const OPT_MODE: usize = 2;
pub const OPT_DEPTH: usize = 3;
pub const OPT_RESOLUTION: usize = 4;
pub const OPT_SOURCE: usize = 5;
pub const OPT_PREVIEW: usize = 6;
pub const OPT_TL_X: usize = 8;
pub const OPT_TL_Y: usize = 9;
pub const OPT_BR_X: usize = 10;
pub const OPT_BR_Y: usize = 11;
pub const OPT_BRIGHTNESS: usize = 13;
pub const OPT_CALIBRATE: usize = 14;
pub const NUM_OPTIONS: usize = 15;

/// Static description of a virtual device
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualDeviceSpec {
    pub name: String,
    pub vendor: String,
    pub model: String,
    /// Remote devices carry a `host:port` address and are hidden from
    /// local-only listings
    pub remote_address: Option<String>,
    pub resolutions: Vec<i32>,
    pub modes: Vec<ColorMode>,
    /// Gray/color depths
    pub depths: Vec<i32>,
    pub sources: Vec<ScanSource>,
    pub max_width_mm: f64,
    pub max_height_mm: f64,
    /// Sheets loaded in the feeder when the layer starts
    pub adf_pages: u32,
    pub calibration: bool,
    pub preview: bool,
}

impl VirtualDeviceSpec {
    /// Letter-width flatbed at 75/150/300/600 dpi
    pub fn flatbed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: "Noname".into(),
            model: "Virtual Flatbed".into(),
            remote_address: None,
            resolutions: vec![75, 150, 300, 600],
            modes: ColorMode::ALL.to_vec(),
            depths: vec![8, 16],
            sources: vec![ScanSource::Flatbed],
            max_width_mm: 215.9,
            max_height_mm: 297.2,
            adf_pages: 0,
            calibration: true,
            preview: true,
        }
    }

    pub fn with_model(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    pub fn with_resolutions(mut self, resolutions: impl Into<Vec<i32>>) -> Self {
        self.resolutions = resolutions.into();
        self
    }

    /// Add a feeder holding `pages` sheets
    pub fn with_adf(mut self, pages: u32, duplex: bool) -> Self {
        self.sources = vec![ScanSource::Flatbed, ScanSource::Adf];
        if duplex {
            self.sources.push(ScanSource::AdfDuplex);
        }
        self.adf_pages = pages;
        self
    }

    pub fn remote(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    pub fn with_calibration(mut self, calibration: bool) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn is_local(&self) -> bool {
        self.remote_address.is_none()
    }

    pub fn descriptor(&self) -> DeviceDescriptor {
        let (kind, address) = match &self.remote_address {
            Some(address) => (TransportKind::Network, address.clone()),
            None => (TransportKind::Usb, format!("emulation:{}", self.name)),
        };
        DeviceDescriptor::new(&self.name, &self.vendor, &self.model, kind, address)
            .with_driver_hint(EMULATION_DRIVER_NAME)
    }

    /// Stock device set: a flatbed, a duplex feeder and a network device
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::flatbed("test:0"),
            Self::flatbed("test:1")
                .with_model("Noname", "Virtual Duplex ADF")
                .with_resolutions([150, 300])
                .with_adf(2, true),
            Self::flatbed("net:scanner.lan")
                .with_model("Noname", "Virtual Network Scanner")
                .with_resolutions([100, 200, 300])
                .remote("scanner.lan:6566")
                .with_calibration(false),
        ]
    }
}

fn mode_names(modes: &[ColorMode]) -> Vec<String> {
    modes.iter().map(|m| m.name().to_string()).collect()
}

fn source_names(sources: &[ScanSource]) -> Vec<String> {
    sources.iter().map(|s| s.name().to_string()).collect()
}

fn geometry(
    name: &'static str,
    title: &'static str,
    max_mm: f64,
) -> OptionDescriptor {
    OptionDescriptor {
        name,
        title,
        description: "Scan area corner in millimetres",
        value_type: OptionValueType::Fixed,
        unit: OptionUnit::Mm,
        capabilities: OptionCapabilities::SOFT_SELECT | OptionCapabilities::SOFT_DETECT,
        constraint: OptionConstraint::FixedRange {
            min: Fixed::from_raw(0),
            max: Fixed::from_f64(max_mm),
            quant: Fixed::from_raw(0),
        },
    }
}

/// Ordered option array for one opened device
#[derive(Debug, Clone)]
pub struct OptionSet {
    descriptors: Vec<OptionDescriptor>,
    values: Vec<OptionValue>,
    calibration: bool,
}

impl OptionSet {
    pub fn build(spec: &VirtualDeviceSpec) -> Self {
        let rw = OptionCapabilities::SOFT_SELECT | OptionCapabilities::SOFT_DETECT;
        let max_x = Fixed::from_f64(spec.max_width_mm);
        let max_y = Fixed::from_f64(spec.max_height_mm);

        let default_mode = spec
            .modes
            .iter()
            .copied()
            .max()
            .unwrap_or(ColorMode::Gray);
        let default_resolution = spec
            .resolutions
            .iter()
            .copied()
            .find(|r| *r >= 150)
            .or_else(|| spec.resolutions.last().copied())
            .unwrap_or(300);

        let mut calibrate_caps = rw | OptionCapabilities::ADVANCED;
        if !spec.calibration {
            calibrate_caps |= OptionCapabilities::INACTIVE;
        }
        let mut preview_caps = rw;
        if !spec.preview {
            preview_caps |= OptionCapabilities::INACTIVE;
        }

        let descriptors = vec![
            OptionDescriptor {
                name: "",
                title: "Number of options",
                description: "Read-only count of options, including this one",
                value_type: OptionValueType::Int,
                unit: OptionUnit::None,
                capabilities: OptionCapabilities::SOFT_DETECT,
                constraint: OptionConstraint::None,
            },
            OptionDescriptor::group("standard", "Standard"),
            OptionDescriptor {
                name: "mode",
                title: "Scan mode",
                description: "Lineart, gray or color scanning",
                value_type: OptionValueType::String,
                unit: OptionUnit::None,
                capabilities: rw,
                constraint: OptionConstraint::StringList(mode_names(&spec.modes)),
            },
            OptionDescriptor {
                name: "depth",
                title: "Bit depth",
                description: "Bits per sample for gray and color",
                value_type: OptionValueType::Int,
                unit: OptionUnit::Bit,
                capabilities: rw,
                constraint: OptionConstraint::WordList(spec.depths.clone()),
            },
            OptionDescriptor {
                name: "resolution",
                title: "Scan resolution",
                description: "Dots per inch, both axes",
                value_type: OptionValueType::Int,
                unit: OptionUnit::Dpi,
                capabilities: rw,
                constraint: OptionConstraint::WordList(spec.resolutions.clone()),
            },
            OptionDescriptor {
                name: "source",
                title: "Scan source",
                description: "Flatbed glass or document feeder",
                value_type: OptionValueType::String,
                unit: OptionUnit::None,
                capabilities: rw,
                constraint: OptionConstraint::StringList(source_names(&spec.sources)),
            },
            OptionDescriptor {
                name: "preview",
                title: "Preview",
                description: "Fast low-quality pass",
                value_type: OptionValueType::Bool,
                unit: OptionUnit::None,
                capabilities: preview_caps,
                constraint: OptionConstraint::None,
            },
            OptionDescriptor::group("geometry", "Geometry"),
            geometry("tl-x", "Top-left x", spec.max_width_mm),
            geometry("tl-y", "Top-left y", spec.max_height_mm),
            geometry("br-x", "Bottom-right x", spec.max_width_mm),
            geometry("br-y", "Bottom-right y", spec.max_height_mm),
            OptionDescriptor::group("enhancement", "Enhancement"),
            OptionDescriptor {
                name: "brightness",
                title: "Brightness",
                description: "Brightness correction, automatic by default",
                value_type: OptionValueType::Int,
                unit: OptionUnit::Percent,
                capabilities: rw | OptionCapabilities::AUTOMATIC,
                constraint: OptionConstraint::IntRange {
                    min: -100,
                    max: 100,
                    quant: 5,
                },
            },
            OptionDescriptor {
                name: "calibrate",
                title: "Calibrate",
                description: "Run shading calibration now",
                value_type: OptionValueType::Button,
                unit: OptionUnit::None,
                capabilities: calibrate_caps,
                constraint: OptionConstraint::None,
            },
        ];

        let values = vec![
            OptionValue::Int(NUM_OPTIONS as i32),
            OptionValue::None,
            OptionValue::Text(default_mode.name().to_string()),
            OptionValue::Int(spec.depths.first().copied().unwrap_or(8)),
            OptionValue::Int(default_resolution),
            OptionValue::Text(ScanSource::Flatbed.name().to_string()),
            OptionValue::Bool(false),
            OptionValue::None,
            OptionValue::Fixed(Fixed::from_raw(0)),
            OptionValue::Fixed(Fixed::from_raw(0)),
            OptionValue::Fixed(max_x),
            OptionValue::Fixed(max_y),
            OptionValue::None,
            OptionValue::Int(0),
            OptionValue::None,
        ];

        let mut set = Self {
            descriptors,
            values,
            calibration: spec.calibration,
        };
        set.refresh_activity();
        set
    }

    pub fn descriptors(&self) -> &[OptionDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, index: usize) -> Result<&OptionDescriptor> {
        self.descriptors.get(index).ok_or_else(|| {
            Error::new(ErrorKind::InvalidParameter, format!("no option at index {index}"))
        })
    }

    /// Index of the option called `name`
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.descriptors
            .iter()
            .position(|d| d.name == name && d.value_type != OptionValueType::Group)
    }

    pub fn get(&self, index: usize) -> Result<OptionValue> {
        let desc = self.descriptor(index)?;
        if !desc.has_value() {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("option {} has no value", desc.title),
            ));
        }
        Ok(self.values[index].clone())
    }

    /// Store a value after checking type, constraint and activity
    ///
    /// Button presses are handled by the caller.
    pub fn set(&mut self, index: usize, value: OptionValue) -> Result<OptionInfo> {
        let desc = self.descriptor(index)?;
        if !desc.is_settable() || !desc.has_value() {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("option {} is read-only", desc.title),
            ));
        }
        if !desc.is_active() {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("option {} is inactive", desc.name),
            ));
        }
        if !value.value_type_matches(desc.value_type) {
            return Err(Error::new(
                ErrorKind::InvalidParameter,
                format!("option {} expects {:?}, got {value:?}", desc.name, desc.value_type),
            ));
        }
        let (stored, inexact) = constrain(&desc.constraint, &value).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidParameter,
                format!("{value} outside constraint of {}", desc.name),
            )
        })?;

        let mut info = OptionInfo::RELOAD_PARAMS;
        if inexact {
            info |= OptionInfo::INEXACT;
        }
        if index == OPT_MODE {
            info |= OptionInfo::RELOAD_OPTIONS;
        }

        self.values[index] = stored;
        self.refresh_activity();
        Ok(info)
    }

    /// Let the device pick the value
    pub fn set_auto(&mut self, index: usize) -> Result<OptionInfo> {
        let desc = self.descriptor(index)?;
        if !desc.capabilities.contains(OptionCapabilities::AUTOMATIC) {
            return Err(Error::not_supported(format!(
                "option {} has no automatic value",
                desc.title
            )));
        }
        if index == OPT_BRIGHTNESS {
            self.values[index] = OptionValue::Int(0);
        }
        Ok(OptionInfo::RELOAD_PARAMS)
    }

    pub fn calibration_supported(&self) -> bool {
        self.calibration
    }

    fn refresh_activity(&mut self) {
        let lineart = self.mode() == ColorMode::Lineart;
        self.descriptors[OPT_DEPTH]
            .capabilities
            .set(OptionCapabilities::INACTIVE, lineart);
    }

    fn text(&self, index: usize) -> &str {
        match &self.values[index] {
            OptionValue::Text(s) => s,
            _ => "",
        }
    }

    fn int(&self, index: usize) -> i32 {
        match self.values[index] {
            OptionValue::Int(v) => v,
            _ => 0,
        }
    }

    fn mm(&self, index: usize) -> f64 {
        match self.values[index] {
            OptionValue::Fixed(v) => v.to_f64(),
            _ => 0.0,
        }
    }

    pub fn mode(&self) -> ColorMode {
        self.text(OPT_MODE).parse().unwrap_or(ColorMode::Gray)
    }

    /// Effective sample depth (1 for lineart)
    pub fn depth(&self) -> u8 {
        match self.mode() {
            ColorMode::Lineart => 1,
            _ => u8::try_from(self.int(OPT_DEPTH)).unwrap_or(8),
        }
    }

    pub fn resolution(&self) -> u32 {
        u32::try_from(self.int(OPT_RESOLUTION)).unwrap_or(0)
    }

    pub fn source(&self) -> ScanSource {
        self.text(OPT_SOURCE).parse().unwrap_or(ScanSource::Flatbed)
    }

    /// Scan area; inverted corners are normalized
    pub fn area(&self) -> ScanArea {
        let (x0, x1) = (self.mm(OPT_TL_X), self.mm(OPT_BR_X));
        let (y0, y1) = (self.mm(OPT_TL_Y), self.mm(OPT_BR_Y));
        ScanArea::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }

    pub fn brightness(&self) -> i32 {
        self.int(OPT_BRIGHTNESS)
    }

    /// Frame layout derived from the current option values
    pub fn frame_parameters(&self, last_frame: bool) -> FrameParameters {
        let area = self.area();
        let resolution = self.resolution();
        FrameParameters::from_geometry(
            self.mode(),
            self.depth(),
            mm_to_pixels(area.width(), resolution),
            mm_to_pixels(area.height(), resolution),
            last_frame,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_option_zero_counts_options() {
        let set = OptionSet::build(&VirtualDeviceSpec::flatbed("test:0"));
        assert_eq!(set.descriptors().len(), NUM_OPTIONS);
        assert_eq!(set.get(OPT_NUM_OPTS).unwrap(), OptionValue::Int(NUM_OPTIONS as i32));
        assert!(set.clone().set(OPT_NUM_OPTS, OptionValue::Int(3)).is_err());
    }

    #[test]
    fn test_named_indices() {
        let set = OptionSet::build(&VirtualDeviceSpec::flatbed("test:0"));
        assert_eq!(set.index_of("resolution"), Some(OPT_RESOLUTION));
        assert_eq!(set.index_of("br-y"), Some(OPT_BR_Y));
        assert_eq!(set.index_of("calibrate"), Some(OPT_CALIBRATE));
        assert_eq!(set.index_of("geometry"), None);
    }

    #[test]
    fn test_defaults() {
        let set = OptionSet::build(&VirtualDeviceSpec::flatbed("test:0"));
        assert_eq!(set.mode(), ColorMode::Color);
        assert_eq!(set.resolution(), 150);
        assert_eq!(set.source(), ScanSource::Flatbed);
        assert!((set.area().right - 215.9).abs() < 1e-3);
    }

    #[test]
    fn test_lineart_deactivates_depth() {
        let mut set = OptionSet::build(&VirtualDeviceSpec::flatbed("test:0"));
        let info = set.set(OPT_MODE, OptionValue::Text("Lineart".into())).unwrap();
        assert!(info.contains(OptionInfo::RELOAD_OPTIONS | OptionInfo::RELOAD_PARAMS));
        assert!(!set.descriptor(OPT_DEPTH).unwrap().is_active());
        assert_eq!(set.depth(), 1);
        assert!(set.set(OPT_DEPTH, OptionValue::Int(16)).is_err());
    }

    #[test]
    fn test_set_auto_requires_automatic() {
        let mut set = OptionSet::build(&VirtualDeviceSpec::flatbed("test:0"));
        set.set(OPT_BRIGHTNESS, OptionValue::Int(40)).unwrap();
        set.set_auto(OPT_BRIGHTNESS).unwrap();
        assert_eq!(set.brightness(), 0);

        let err = set.set_auto(OPT_RESOLUTION).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_group_has_no_value() {
        let set = OptionSet::build(&VirtualDeviceSpec::flatbed("test:0"));
        assert!(set.get(1).is_err());
        assert!(set.get(NUM_OPTIONS).is_err());
    }

    #[test]
    fn test_frame_parameters_follow_options() {
        let mut set = OptionSet::build(&VirtualDeviceSpec::flatbed("test:0"));
        set.set(OPT_RESOLUTION, OptionValue::Int(300)).unwrap();
        set.set(OPT_BR_X, OptionValue::Fixed(Fixed::from_f64(210.0))).unwrap();
        set.set(OPT_BR_Y, OptionValue::Fixed(Fixed::from_f64(297.0))).unwrap();

        let layout = set.frame_parameters(true);
        assert_eq!(layout.pixels_per_line, 2480);
        assert_eq!(layout.lines, 3507);
        assert_eq!(layout.bytes_per_line, 2480 * 3);
    }

    #[test]
    fn test_default_device_set() {
        let specs = VirtualDeviceSpec::defaults();
        assert_eq!(specs.len(), 3);
        assert!(specs[0].is_local());
        assert!(specs[1].sources.contains(&ScanSource::AdfDuplex));
        assert!(!specs[2].is_local());
        for spec in &specs {
            assert!(spec.descriptor().validate().is_ok(), "{}", spec.name);
        }
    }
}
