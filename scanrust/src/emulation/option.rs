//! Option descriptors and the option-control protocol

use std::fmt;

use bitflags::bitflags;

/// SANE 16.16 fixed-point value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fixed(i32);

impl Fixed {
    const SCALE: f64 = 65536.0;

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn from_f64(value: f64) -> Self {
        Self((value * Self::SCALE).round() as i32)
    }

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / Self::SCALE
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.to_f64())
    }
}

/// Type of an option's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValueType {
    Bool,
    Int,
    Fixed,
    String,
    /// Action trigger without a value
    Button,
    /// Grouping header without a value
    Group,
}

/// Physical unit of an option's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionUnit {
    None,
    Pixel,
    Bit,
    Mm,
    Dpi,
    Percent,
}

/// Accepted values of an option
#[derive(Debug, Clone, PartialEq)]
pub enum OptionConstraint {
    None,
    /// Inclusive range; `quant` of zero means any step
    IntRange { min: i32, max: i32, quant: i32 },
    FixedRange { min: Fixed, max: Fixed, quant: Fixed },
    WordList(Vec<i32>),
    StringList(Vec<String>),
}

bitflags! {
    /// How an option may be read and written
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OptionCapabilities: u8 {
        /// Settable in software
        const SOFT_SELECT = 1;
        /// Readable in software
        const SOFT_DETECT = 1 << 1;
        /// Device can choose a value itself (`SetAuto`)
        const AUTOMATIC = 1 << 2;
        /// Currently has no effect
        const INACTIVE = 1 << 3;
        /// Expert setting
        const ADVANCED = 1 << 4;
    }
}

bitflags! {
    /// Side effects reported by a `SetValue` or `SetAuto`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OptionInfo: u8 {
        /// Stored value differs from the requested one
        const INEXACT = 1;
        /// Other options' descriptors changed
        const RELOAD_OPTIONS = 1 << 1;
        /// Frame parameters changed
        const RELOAD_PARAMS = 1 << 2;
    }
}

/// Description of one negotiable device setting
#[derive(Debug, Clone, PartialEq)]
pub struct OptionDescriptor {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub value_type: OptionValueType,
    pub unit: OptionUnit,
    pub capabilities: OptionCapabilities,
    pub constraint: OptionConstraint,
}

impl OptionDescriptor {
    pub fn group(name: &'static str, title: &'static str) -> Self {
        Self {
            name,
            title,
            description: "",
            value_type: OptionValueType::Group,
            unit: OptionUnit::None,
            capabilities: OptionCapabilities::empty(),
            constraint: OptionConstraint::None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.capabilities.contains(OptionCapabilities::INACTIVE)
    }

    pub fn is_settable(&self) -> bool {
        self.capabilities.contains(OptionCapabilities::SOFT_SELECT)
    }

    /// Options with a readable value (not groups or buttons)
    pub fn has_value(&self) -> bool {
        !matches!(self.value_type, OptionValueType::Button | OptionValueType::Group)
    }
}

/// Value of an option
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i32),
    Fixed(Fixed),
    Text(String),
    /// Button press, or the value of a group/button option
    None,
}

impl OptionValue {
    pub fn value_type_matches(&self, value_type: OptionValueType) -> bool {
        matches!(
            (self, value_type),
            (Self::Bool(_), OptionValueType::Bool)
                | (Self::Int(_), OptionValueType::Int)
                | (Self::Fixed(_), OptionValueType::Fixed)
                | (Self::Text(_), OptionValueType::String)
                | (Self::None, OptionValueType::Button)
        )
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Fixed(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::None => f.write_str("-"),
        }
    }
}

/// Option-control action
#[derive(Debug, Clone, PartialEq)]
pub enum OptionAction {
    GetValue,
    SetValue(OptionValue),
    SetAuto,
}

/// Check a value against a constraint
///
/// Returns the value to store and whether it was snapped to the range
/// quantization. Out-of-range values are rejected with `None`.
pub(crate) fn constrain(constraint: &OptionConstraint, value: &OptionValue) -> Option<(OptionValue, bool)> {
    match (constraint, value) {
        (OptionConstraint::None, v) => Some((v.clone(), false)),
        (OptionConstraint::IntRange { min, max, quant }, OptionValue::Int(v)) => {
            if v < min || v > max {
                return None;
            }
            let snapped = snap(*v, *min, *quant);
            Some((OptionValue::Int(snapped), snapped != *v))
        }
        (OptionConstraint::FixedRange { min, max, quant }, OptionValue::Fixed(v)) => {
            if v < min || v > max {
                return None;
            }
            let snapped = Fixed::from_raw(snap(v.raw(), min.raw(), quant.raw()));
            Some((OptionValue::Fixed(snapped), snapped != *v))
        }
        (OptionConstraint::WordList(words), OptionValue::Int(v)) => {
            words.contains(v).then(|| (value.clone(), false))
        }
        (OptionConstraint::StringList(items), OptionValue::Text(s)) => {
            items.iter().any(|i| i == s).then(|| (value.clone(), false))
        }
        _ => None,
    }
}

fn snap(value: i32, min: i32, quant: i32) -> i32 {
    if quant <= 0 {
        return value;
    }
    let steps = (i64::from(value) - i64::from(min) + i64::from(quant) / 2) / i64::from(quant);
    (i64::from(min) + steps * i64::from(quant)) as i32
}
