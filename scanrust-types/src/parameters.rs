//! Scan parameters and the generic parameter surface
//!
//! Callers outside the crate address settings by name through
//! [`ParameterKind`] and [`ParameterValue`]; internally every setting is a
//! typed field of [`ScanParameters`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Millimetres per inch
pub const MM_PER_INCH: f64 = 25.4;

/// Color mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColorMode {
    /// 1-bit black and white
    Lineart,
    Gray,
    Color,
}

impl ColorMode {
    pub const ALL: [ColorMode; 3] = [Self::Lineart, Self::Gray, Self::Color];

    /// SANE-style mode name
    pub fn name(self) -> &'static str {
        match self {
            Self::Lineart => "Lineart",
            Self::Gray => "Gray",
            Self::Color => "Color",
        }
    }

    /// Samples per pixel
    pub fn channels(self) -> u32 {
        match self {
            Self::Lineart | Self::Gray => 1,
            Self::Color => 3,
        }
    }

    /// Bit depth used when none is requested explicitly
    pub fn default_depth(self) -> u8 {
        match self {
            Self::Lineart => 1,
            Self::Gray | Self::Color => 8,
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ColorMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lineart" | "binary" => Ok(Self::Lineart),
            "gray" | "grey" | "grayscale" => Ok(Self::Gray),
            "color" | "colour" | "rgb" => Ok(Self::Color),
            _ => Err(Error::Parse(format!("unknown color mode: {s}"))),
        }
    }
}

/// Encoding of the delivered buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputEncoding {
    /// Uncompressed samples, line by line
    Raw,
    /// Device-side JPEG
    Jpeg,
}

impl OutputEncoding {
    pub fn name(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for OutputEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            _ => Err(Error::Parse(format!("unknown encoding: {s}"))),
        }
    }
}

/// Paper source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScanSource {
    Flatbed,
    Adf,
    AdfDuplex,
}

impl ScanSource {
    pub fn name(self) -> &'static str {
        match self {
            Self::Flatbed => "Flatbed",
            Self::Adf => "ADF",
            Self::AdfDuplex => "ADF Duplex",
        }
    }

    /// Frames produced per fed sheet
    pub fn sides(self) -> u32 {
        match self {
            Self::AdfDuplex => 2,
            Self::Flatbed | Self::Adf => 1,
        }
    }
}

impl fmt::Display for ScanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScanSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "flatbed" => Ok(Self::Flatbed),
            "adf" | "adf front" => Ok(Self::Adf),
            "adf duplex" | "duplex" => Ok(Self::AdfDuplex),
            _ => Err(Error::Parse(format!("unknown source: {s}"))),
        }
    }
}

/// Rectangle in millimetres, origin at the top-left of the glass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanArea {
    pub left: f64,
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
}

impl ScanArea {
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.bottom - self.top
    }

    /// Finite coordinates with positive extent
    pub fn is_well_formed(&self) -> bool {
        [self.left, self.top, self.right, self.bottom]
            .iter()
            .all(|v| v.is_finite())
            && self.right > self.left
            && self.bottom > self.top
    }

    pub fn contains(&self, other: &ScanArea) -> bool {
        other.left >= self.left
            && other.top >= self.top
            && other.right <= self.right
            && other.bottom <= self.bottom
    }
}

/// Generic parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view; integers widen to float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Known parameter kinds, plus vendor extensions by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterKind {
    Resolution,
    ColorMode,
    BitDepth,
    Encoding,
    Source,
    Preview,
    AreaLeft,
    AreaTop,
    AreaRight,
    AreaBottom,
    Vendor(String),
}

impl ParameterKind {
    /// Every non-vendor kind
    pub const STANDARD: [ParameterKind; 10] = [
        Self::Resolution,
        Self::ColorMode,
        Self::BitDepth,
        Self::Encoding,
        Self::Source,
        Self::Preview,
        Self::AreaLeft,
        Self::AreaTop,
        Self::AreaRight,
        Self::AreaBottom,
    ];

    pub fn name(&self) -> &str {
        match self {
            Self::Resolution => "resolution",
            Self::ColorMode => "mode",
            Self::BitDepth => "depth",
            Self::Encoding => "encoding",
            Self::Source => "source",
            Self::Preview => "preview",
            Self::AreaLeft => "tl-x",
            Self::AreaTop => "tl-y",
            Self::AreaRight => "br-x",
            Self::AreaBottom => "br-y",
            Self::Vendor(name) => name,
        }
    }

    /// Map a name to a kind; unknown names become [`ParameterKind::Vendor`]
    pub fn from_name(name: &str) -> Self {
        match name {
            "resolution" => Self::Resolution,
            "mode" => Self::ColorMode,
            "depth" => Self::BitDepth,
            "encoding" => Self::Encoding,
            "source" => Self::Source,
            "preview" => Self::Preview,
            "tl-x" => Self::AreaLeft,
            "tl-y" => Self::AreaTop,
            "br-x" => Self::AreaRight,
            "br-y" => Self::AreaBottom,
            other => Self::Vendor(other.to_string()),
        }
    }
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Negotiated scan parameters
///
/// Validated against a [`CapabilityDescriptor`](crate::CapabilityDescriptor)
/// before use.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanParameters {
    /// Dots per inch, both axes
    pub resolution: u32,
    pub color_mode: ColorMode,
    pub bit_depth: u8,
    pub encoding: OutputEncoding,
    pub source: ScanSource,
    pub preview: bool,
    pub area: ScanArea,
    /// Vendor extensions, keyed by option name
    pub extensions: BTreeMap<String, ParameterValue>,
}

impl ScanParameters {
    /// Raw flatbed scan with the mode's default depth
    pub fn new(resolution: u32, color_mode: ColorMode, area: ScanArea) -> Self {
        Self {
            resolution,
            color_mode,
            bit_depth: color_mode.default_depth(),
            encoding: OutputEncoding::Raw,
            source: ScanSource::Flatbed,
            preview: false,
            area,
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_bit_depth(mut self, depth: u8) -> Self {
        self.bit_depth = depth;
        self
    }

    pub fn with_source(mut self, source: ScanSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_encoding(mut self, encoding: OutputEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: ParameterValue) -> Self {
        self.extensions.insert(name.into(), value);
        self
    }

    /// Read one parameter
    pub fn get(&self, kind: &ParameterKind) -> Option<ParameterValue> {
        let value = match kind {
            ParameterKind::Resolution => ParameterValue::Int(i64::from(self.resolution)),
            ParameterKind::ColorMode => ParameterValue::Text(self.color_mode.name().into()),
            ParameterKind::BitDepth => ParameterValue::Int(i64::from(self.bit_depth)),
            ParameterKind::Encoding => ParameterValue::Text(self.encoding.name().into()),
            ParameterKind::Source => ParameterValue::Text(self.source.name().into()),
            ParameterKind::Preview => ParameterValue::Bool(self.preview),
            ParameterKind::AreaLeft => ParameterValue::Float(self.area.left),
            ParameterKind::AreaTop => ParameterValue::Float(self.area.top),
            ParameterKind::AreaRight => ParameterValue::Float(self.area.right),
            ParameterKind::AreaBottom => ParameterValue::Float(self.area.bottom),
            ParameterKind::Vendor(name) => return self.extensions.get(name).cloned(),
        };
        Some(value)
    }

    /// Write one parameter, checking the value type
    ///
    /// Only the type is checked here; range checks happen against the
    /// capability descriptor.
    pub fn set(&mut self, kind: &ParameterKind, value: ParameterValue) -> Result<()> {
        let mismatch = |expected| Error::TypeMismatch {
            name: kind.name().to_string(),
            expected,
        };

        match kind {
            ParameterKind::Resolution => {
                let dpi = value.as_int().ok_or_else(|| mismatch("int"))?;
                self.resolution = u32::try_from(dpi)
                    .map_err(|_| Error::invalid("resolution", format!("{dpi} out of range")))?;
            }
            ParameterKind::ColorMode => {
                let mode: ColorMode = value.as_text().ok_or_else(|| mismatch("text"))?.parse()?;
                if mode == ColorMode::Lineart || self.color_mode == ColorMode::Lineart {
                    self.bit_depth = mode.default_depth();
                }
                self.color_mode = mode;
            }
            ParameterKind::BitDepth => {
                let depth = value.as_int().ok_or_else(|| mismatch("int"))?;
                self.bit_depth = u8::try_from(depth)
                    .map_err(|_| Error::invalid("depth", format!("{depth} out of range")))?;
            }
            ParameterKind::Encoding => {
                self.encoding = value.as_text().ok_or_else(|| mismatch("text"))?.parse()?;
            }
            ParameterKind::Source => {
                self.source = value.as_text().ok_or_else(|| mismatch("text"))?.parse()?;
            }
            ParameterKind::Preview => {
                self.preview = value.as_bool().ok_or_else(|| mismatch("bool"))?;
            }
            ParameterKind::AreaLeft => {
                self.area.left = value.as_float().ok_or_else(|| mismatch("float"))?;
            }
            ParameterKind::AreaTop => {
                self.area.top = value.as_float().ok_or_else(|| mismatch("float"))?;
            }
            ParameterKind::AreaRight => {
                self.area.right = value.as_float().ok_or_else(|| mismatch("float"))?;
            }
            ParameterKind::AreaBottom => {
                self.area.bottom = value.as_float().ok_or_else(|| mismatch("float"))?;
            }
            ParameterKind::Vendor(name) => {
                self.extensions.insert(name.clone(), value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn a4() -> ScanArea {
        ScanArea::new(0.0, 0.0, 210.0, 297.0)
    }

    #[test]
    fn test_kind_names_round_trip() {
        for kind in ParameterKind::STANDARD {
            assert_eq!(ParameterKind::from_name(kind.name()), kind);
        }
        assert_eq!(
            ParameterKind::from_name("brightness"),
            ParameterKind::Vendor("brightness".into())
        );
    }

    #[test]
    fn test_set_checks_type() {
        let mut params = ScanParameters::new(300, ColorMode::Color, a4());
        let err = params
            .set(&ParameterKind::Resolution, ParameterValue::Text("high".into()))
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
        assert_eq!(params.resolution, 300);
    }

    #[test]
    fn test_set_mode_adjusts_lineart_depth() {
        let mut params = ScanParameters::new(300, ColorMode::Color, a4());
        params
            .set(&ParameterKind::ColorMode, ParameterValue::Text("lineart".into()))
            .unwrap();
        assert_eq!(params.color_mode, ColorMode::Lineart);
        assert_eq!(params.bit_depth, 1);

        params
            .set(&ParameterKind::ColorMode, ParameterValue::Text("Gray".into()))
            .unwrap();
        assert_eq!(params.bit_depth, 8);
    }

    #[test]
    fn test_area_accepts_int() {
        let mut params = ScanParameters::new(300, ColorMode::Gray, a4());
        params.set(&ParameterKind::AreaRight, ParameterValue::Int(100)).unwrap();
        assert_eq!(params.get(&ParameterKind::AreaRight), Some(ParameterValue::Float(100.0)));
    }

    #[test]
    fn test_negative_resolution_rejected() {
        let mut params = ScanParameters::new(300, ColorMode::Gray, a4());
        assert!(params.set(&ParameterKind::Resolution, ParameterValue::Int(-75)).is_err());
    }

    #[test]
    fn test_vendor_extension() {
        let mut params = ScanParameters::new(300, ColorMode::Gray, a4());
        let kind = ParameterKind::Vendor("gain".into());
        assert_eq!(params.get(&kind), None);
        params.set(&kind, ParameterValue::Int(20)).unwrap();
        assert_eq!(params.get(&kind), Some(ParameterValue::Int(20)));
    }

    #[test]
    fn test_area_geometry() {
        let area = ScanArea::new(10.0, 20.0, 110.0, 70.0);
        assert_eq!(area.width(), 100.0);
        assert_eq!(area.height(), 50.0);
        assert!(area.is_well_formed());
        assert!(a4().contains(&area));
        assert!(!ScanArea::new(5.0, 5.0, 5.0, 10.0).is_well_formed());
        assert!(!ScanArea::new(0.0, 0.0, f64::NAN, 10.0).is_well_formed());
    }
}
