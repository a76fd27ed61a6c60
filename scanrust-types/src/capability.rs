//! Device capabilities and parameter validation

use std::collections::BTreeSet;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::parameters::{
    ColorMode, OutputEncoding, ParameterValue, ScanArea, ScanParameters, ScanSource,
};

bitflags! {
    /// Optional device features
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapabilityFlags: u8 {
        /// Automatic document feeder
        const ADF = 1;
        /// Two-sided feeder scanning
        const DUPLEX = 1 << 1;
        /// Fast low-resolution preview pass
        const PREVIEW = 1 << 2;
        /// Shading calibration available
        const CALIBRATION = 1 << 3;
    }
}

/// Constraint on a vendor extension value
#[derive(Debug, Clone, PartialEq)]
pub enum VendorConstraint {
    None,
    /// Inclusive range; a `step` above 1 admits only `min + k * step`
    IntRange { min: i64, max: i64, step: i64 },
    FloatRange { min: f64, max: f64 },
    List(Vec<String>),
}

/// Vendor-specific tunable exposed through the generic parameter surface
#[derive(Debug, Clone, PartialEq)]
pub struct VendorOption {
    pub name: String,
    pub default: ParameterValue,
    pub constraint: VendorConstraint,
}

impl VendorOption {
    pub fn new(name: impl Into<String>, default: ParameterValue, constraint: VendorConstraint) -> Self {
        Self {
            name: name.into(),
            default,
            constraint,
        }
    }

    /// Check a candidate value against type and constraint
    pub fn check(&self, value: &ParameterValue) -> Result<()> {
        let same_type = match (&self.default, value) {
            (ParameterValue::Float(_), ParameterValue::Int(_)) => true,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        };
        if !same_type {
            return Err(Error::TypeMismatch {
                name: self.name.clone(),
                expected: self.default.type_name(),
            });
        }

        match &self.constraint {
            VendorConstraint::None => Ok(()),
            VendorConstraint::IntRange { min, max, step } => match value.as_int() {
                Some(v) if !(*min..=*max).contains(&v) => {
                    Err(Error::invalid(&self.name, format!("{value} outside {min}..={max}")))
                }
                Some(v) if *step > 1 && (v - min) % step != 0 => Err(Error::invalid(
                    &self.name,
                    format!("{value} not a multiple of {step} from {min}"),
                )),
                Some(_) => Ok(()),
                None => Err(Error::invalid(&self.name, format!("{value} is not an integer"))),
            },
            VendorConstraint::FloatRange { min, max } => match value.as_float() {
                Some(v) if v >= *min && v <= *max => Ok(()),
                _ => Err(Error::invalid(&self.name, format!("{value} outside {min}..={max}"))),
            },
            VendorConstraint::List(items) => match value.as_text() {
                Some(v) if items.iter().any(|i| i == v) => Ok(()),
                _ => Err(Error::invalid(&self.name, format!("{value} not one of {items:?}"))),
            },
        }
    }
}

/// What an open device can do
///
/// Computed once per open session and cached; read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDescriptor {
    /// Supported resolutions (dpi)
    pub resolutions: BTreeSet<u32>,
    pub color_modes: BTreeSet<ColorMode>,
    /// Supported depths for gray and color; lineart is always 1-bit
    pub bit_depths: BTreeSet<u8>,
    pub encodings: BTreeSet<OutputEncoding>,
    /// Smallest accepted area (width/height taken from this rect)
    pub min_area: ScanArea,
    /// Full scannable area
    pub max_area: ScanArea,
    pub flags: CapabilityFlags,
    pub vendor_options: Vec<VendorOption>,
}

impl CapabilityDescriptor {
    pub fn vendor_option(&self, name: &str) -> Option<&VendorOption> {
        self.vendor_options.iter().find(|o| o.name == name)
    }

    /// Sources allowed by the flags
    pub fn sources(&self) -> Vec<ScanSource> {
        let mut sources = vec![ScanSource::Flatbed];
        if self.flags.contains(CapabilityFlags::ADF) {
            sources.push(ScanSource::Adf);
            if self.flags.contains(CapabilityFlags::DUPLEX) {
                sources.push(ScanSource::AdfDuplex);
            }
        }
        sources
    }

    /// Validate parameters
    ///
    /// Out-of-range values are rejected, never clamped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] naming the first offending field,
    /// or [`Error::TypeMismatch`] for a badly typed vendor extension.
    pub fn validate(&self, params: &ScanParameters) -> Result<()> {
        if !self.resolutions.contains(&params.resolution) {
            return Err(Error::invalid(
                "resolution",
                format!("{} dpi not in {:?}", params.resolution, self.resolutions),
            ));
        }

        if !self.color_modes.contains(&params.color_mode) {
            return Err(Error::invalid(
                "mode",
                format!("{} not supported", params.color_mode),
            ));
        }

        match params.color_mode {
            ColorMode::Lineart if params.bit_depth != 1 => {
                return Err(Error::invalid("depth", "lineart requires 1-bit depth"));
            }
            ColorMode::Gray | ColorMode::Color
                if params.bit_depth == 1 || !self.bit_depths.contains(&params.bit_depth) =>
            {
                return Err(Error::invalid(
                    "depth",
                    format!("{}-bit not supported for {}", params.bit_depth, params.color_mode),
                ));
            }
            _ => {}
        }

        if !self.encodings.contains(&params.encoding) {
            return Err(Error::invalid(
                "encoding",
                format!("{} not supported", params.encoding),
            ));
        }

        if !self.sources().contains(&params.source) {
            return Err(Error::invalid(
                "source",
                format!("{} not available", params.source),
            ));
        }

        if params.preview && !self.flags.contains(CapabilityFlags::PREVIEW) {
            return Err(Error::invalid("preview", "preview not supported"));
        }

        let area = &params.area;
        if !area.is_well_formed() {
            return Err(Error::invalid("area", format!("malformed rect {area:?}")));
        }
        if !self.max_area.contains(area) {
            return Err(Error::invalid(
                "area",
                format!("{area:?} exceeds {:?}", self.max_area),
            ));
        }
        if area.width() < self.min_area.width() || area.height() < self.min_area.height() {
            return Err(Error::invalid(
                "area",
                format!(
                    "{:.2}x{:.2} mm below minimum {:.2}x{:.2} mm",
                    area.width(),
                    area.height(),
                    self.min_area.width(),
                    self.min_area.height()
                ),
            ));
        }

        for (name, value) in &params.extensions {
            let option = self
                .vendor_option(name)
                .ok_or_else(|| Error::invalid(name, "unknown vendor option"))?;
            option.check(value)?;
        }

        Ok(())
    }

    /// Reasonable starting parameters for this device
    ///
    /// Color at the lowest resolution of at least 150 dpi over the full
    /// flatbed area, with every vendor option at its default.
    pub fn default_parameters(&self) -> ScanParameters {
        let resolution = self
            .resolutions
            .iter()
            .copied()
            .find(|r| *r >= 150)
            .or_else(|| self.resolutions.iter().next_back().copied())
            .unwrap_or(300);

        let color_mode = [ColorMode::Color, ColorMode::Gray, ColorMode::Lineart]
            .into_iter()
            .find(|m| self.color_modes.contains(m))
            .unwrap_or(ColorMode::Gray);

        let bit_depth = if color_mode == ColorMode::Lineart || self.bit_depths.contains(&8) {
            color_mode.default_depth()
        } else {
            self.bit_depths
                .iter()
                .copied()
                .find(|d| *d > 1)
                .unwrap_or(8)
        };

        let encoding = if self.encodings.contains(&OutputEncoding::Raw) {
            OutputEncoding::Raw
        } else {
            self.encodings.iter().next().copied().unwrap_or(OutputEncoding::Raw)
        };

        let mut params = ScanParameters::new(resolution, color_mode, self.max_area)
            .with_bit_depth(bit_depth)
            .with_encoding(encoding);
        for option in &self.vendor_options {
            params.extensions.insert(option.name.clone(), option.default.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn flatbed() -> CapabilityDescriptor {
        CapabilityDescriptor {
            resolutions: [75, 150, 300, 600].into_iter().collect(),
            color_modes: ColorMode::ALL.into_iter().collect(),
            bit_depths: [1, 8, 16].into_iter().collect(),
            encodings: [OutputEncoding::Raw].into_iter().collect(),
            min_area: ScanArea::new(0.0, 0.0, 5.0, 5.0),
            max_area: ScanArea::new(0.0, 0.0, 215.9, 297.2),
            flags: CapabilityFlags::PREVIEW | CapabilityFlags::CALIBRATION,
            vendor_options: vec![VendorOption::new(
                "gain",
                ParameterValue::Int(16),
                VendorConstraint::IntRange { min: 0, max: 63, step: 1 },
            )],
        }
    }

    fn a4(resolution: u32) -> ScanParameters {
        ScanParameters::new(resolution, ColorMode::Color, ScanArea::new(0.0, 0.0, 210.0, 297.0))
    }

    #[test]
    fn test_accepts_supported_parameters() {
        assert!(flatbed().validate(&a4(300)).is_ok());
    }

    #[test]
    fn test_rejects_unsupported_resolution() {
        let err = flatbed().validate(&a4(200)).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == "resolution"));
    }

    #[test]
    fn test_rejects_area_outside_glass() {
        let mut params = a4(300);
        params.area.bottom = 356.0;
        assert!(flatbed().validate(&params).is_err());
    }

    #[test]
    fn test_rejects_area_below_minimum() {
        let mut params = a4(300);
        params.area = ScanArea::new(10.0, 10.0, 12.0, 40.0);
        assert!(flatbed().validate(&params).is_err());
    }

    #[test]
    fn test_rejects_lineart_depth_mismatch() {
        let params = ScanParameters::new(300, ColorMode::Lineart, ScanArea::new(0.0, 0.0, 10.0, 10.0))
            .with_bit_depth(8);
        assert!(flatbed().validate(&params).is_err());
    }

    #[test]
    fn test_rejects_adf_without_feeder() {
        let params = a4(300).with_source(ScanSource::Adf);
        assert!(flatbed().validate(&params).is_err());
    }

    #[test]
    fn test_vendor_option_checks() {
        let caps = flatbed();
        assert!(caps.validate(&a4(300).with_extension("gain", ParameterValue::Int(40))).is_ok());
        assert!(caps.validate(&a4(300).with_extension("gain", ParameterValue::Int(64))).is_err());
        assert!(caps
            .validate(&a4(300).with_extension("gain", ParameterValue::Text("x".into())))
            .is_err());
        assert!(caps
            .validate(&a4(300).with_extension("exposure", ParameterValue::Int(1)))
            .is_err());
    }

    #[test]
    fn test_quantized_vendor_option_rejects_off_step_values() {
        let brightness = VendorOption::new(
            "brightness",
            ParameterValue::Int(0),
            VendorConstraint::IntRange { min: -100, max: 100, step: 5 },
        );
        assert!(brightness.check(&ParameterValue::Int(10)).is_ok());
        assert!(brightness.check(&ParameterValue::Int(-95)).is_ok());
        let err = brightness.check(&ParameterValue::Int(12)).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { ref name, .. } if name == "brightness"));
    }

    #[test]
    fn test_default_parameters_are_valid() {
        let caps = flatbed();
        let params = caps.default_parameters();
        assert_eq!(params.resolution, 150);
        assert_eq!(params.color_mode, ColorMode::Color);
        assert_eq!(params.extensions.get("gain"), Some(&ParameterValue::Int(16)));
        assert!(caps.validate(&params).is_ok());
    }

    #[test]
    fn test_sources_follow_flags() {
        let mut caps = flatbed();
        assert_eq!(caps.sources(), vec![ScanSource::Flatbed]);
        caps.flags |= CapabilityFlags::ADF | CapabilityFlags::DUPLEX;
        assert_eq!(
            caps.sources(),
            vec![ScanSource::Flatbed, ScanSource::Adf, ScanSource::AdfDuplex]
        );
    }
}
