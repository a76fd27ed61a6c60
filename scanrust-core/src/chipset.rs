//! Chipset identification table
//!
//! Every supported chipset speaks the same framing and command set. They
//! differ in register addresses, the initialization sequence, and the
//! optical limits listed here.

use std::fmt;

use crate::error::{Error, Result};

/// Supported scanner chipsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChipsetKind {
    /// Genesys Logic GL841
    Gl841,
    /// Genesys Logic GL843
    Gl843,
    /// Genesys Logic GL846
    Gl846,
    /// National Semiconductor LM9831
    Lm9831,
    /// Realtek RTS8822
    Rts8822,
}

impl ChipsetKind {
    pub const ALL: [ChipsetKind; 5] = [
        Self::Gl841,
        Self::Gl843,
        Self::Gl846,
        Self::Lm9831,
        Self::Rts8822,
    ];

    /// Static table entry for this chipset
    pub fn info(self) -> &'static ChipsetInfo {
        match self {
            Self::Gl841 => &CHIPSETS[0],
            Self::Gl843 => &CHIPSETS[1],
            Self::Gl846 => &CHIPSETS[2],
            Self::Lm9831 => &CHIPSETS[3],
            Self::Rts8822 => &CHIPSETS[4],
        }
    }

    /// Short lowercase name, used as a driver hint
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ChipsetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Register addresses used by the adapter
///
/// Byte registers: `status`, `lamp`, `mode`, `depth`, `gain`, `offset`.
/// Word (u16) registers: the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub status: u16,
    pub lamp: u16,
    pub mode: u16,
    pub depth: u16,
    pub resolution: u16,
    pub start_x: u16,
    pub start_y: u16,
    pub pixels: u16,
    pub lines: u16,
    pub gain: u16,
    pub offset: u16,
}

/// Static description of one chipset
#[derive(Debug, PartialEq)]
pub struct ChipsetInfo {
    pub kind: ChipsetKind,
    /// Value returned by `CMD_IDENTIFY`
    pub chip_id: u16,
    pub name: &'static str,
    pub vendor: &'static str,
    /// Scanner models known to carry this chipset
    pub models: &'static [&'static str],
    /// USB (vendor, product) pairs
    pub usb_ids: &'static [(u16, u16)],
    pub registers: RegisterMap,
    /// Ordered (register, value) writes applied after identification
    pub init_sequence: &'static [(u16, u8)],
    /// Supported resolutions in dpi, ascending
    pub resolutions: &'static [u32],
    /// Supported gray/color depths
    pub depths: &'static [u8],
    pub max_width_mm: f64,
    pub max_height_mm: f64,
    /// Largest data chunk the chipset returns per read
    pub max_chunk: usize,
    pub calibration: bool,
    pub preview: bool,
}

impl ChipsetInfo {
    /// Match a descriptor's model string against the known model list
    pub fn matches_model(&self, model: &str) -> bool {
        let model = model.to_ascii_lowercase();
        self.models
            .iter()
            .any(|m| model.contains(&m.to_ascii_lowercase()))
    }

    pub fn matches_usb_id(&self, vendor_id: u16, product_id: u16) -> bool {
        self.usb_ids.contains(&(vendor_id, product_id))
    }
}

const GENESYS_MAP: RegisterMap = RegisterMap {
    status: 0x41,
    lamp: 0x03,
    mode: 0x04,
    depth: 0x05,
    resolution: 0x2C,
    start_x: 0x30,
    start_y: 0x3D,
    pixels: 0x32,
    lines: 0x25,
    gain: 0x28,
    offset: 0x29,
};

/// Every chipset the hardware drivers can drive, in [`ChipsetKind`] order
pub static CHIPSETS: [ChipsetInfo; 5] = [
    ChipsetInfo {
        kind: ChipsetKind::Gl841,
        chip_id: 0x0841,
        name: "gl841",
        vendor: "Genesys Logic",
        models: &["CanoScan LiDE 35", "CanoScan LiDE 60", "Visioneer OneTouch 7100"],
        usb_ids: &[(0x04A9, 0x2213), (0x04A9, 0x221C), (0x04A7, 0x0229)],
        registers: GENESYS_MAP,
        init_sequence: &[(0x01, 0x82), (0x02, 0x30), (0x03, 0x00), (0x06, 0x18), (0x0A, 0x00)],
        resolutions: &[75, 150, 300, 600, 1200],
        depths: &[8, 16],
        max_width_mm: 215.9,
        max_height_mm: 297.2,
        max_chunk: 32 * 1024,
        calibration: true,
        preview: true,
    },
    ChipsetInfo {
        kind: ChipsetKind::Gl843,
        chip_id: 0x0843,
        name: "gl843",
        vendor: "Genesys Logic",
        models: &["CanoScan 8400F", "CanoScan 8600F", "CanoScan 4400F"],
        usb_ids: &[(0x04A9, 0x221E), (0x04A9, 0x2229), (0x04A9, 0x2228)],
        registers: RegisterMap {
            depth: 0x06,
            ..GENESYS_MAP
        },
        init_sequence: &[(0x01, 0x00), (0x02, 0x78), (0x03, 0x00), (0x0B, 0x6A), (0x6B, 0x02)],
        resolutions: &[75, 150, 300, 600, 1200, 2400],
        depths: &[8, 16],
        max_width_mm: 215.9,
        max_height_mm: 297.2,
        max_chunk: 64 * 1024 - 1,
        calibration: true,
        preview: true,
    },
    ChipsetInfo {
        kind: ChipsetKind::Gl846,
        chip_id: 0x0846,
        name: "gl846",
        vendor: "Genesys Logic",
        models: &["Plustek OpticBook 3800", "Visioneer Strobe XP 100"],
        usb_ids: &[(0x07B3, 0x1300), (0x04A7, 0x04AC)],
        registers: RegisterMap {
            depth: 0x06,
            gain: 0x80,
            offset: 0x81,
            ..GENESYS_MAP
        },
        init_sequence: &[(0x01, 0x60), (0x02, 0x22), (0x03, 0x00), (0x6B, 0x0C)],
        resolutions: &[75, 150, 300, 600],
        depths: &[8],
        max_width_mm: 216.0,
        max_height_mm: 355.6,
        max_chunk: 32 * 1024,
        calibration: true,
        preview: false,
    },
    ChipsetInfo {
        kind: ChipsetKind::Lm9831,
        chip_id: 0x9831,
        name: "lm9831",
        vendor: "National Semiconductor",
        models: &["Plustek OpticPro U12", "Plustek OpticPro UT12", "Mustek BearPaw 1200"],
        usb_ids: &[(0x07B3, 0x0010), (0x07B3, 0x0011), (0x055F, 0x0219)],
        registers: RegisterMap {
            status: 0x02,
            lamp: 0x2C,
            mode: 0x26,
            depth: 0x27,
            resolution: 0x09,
            start_x: 0x22,
            start_y: 0x24,
            pixels: 0x20,
            lines: 0x4A,
            gain: 0x3B,
            offset: 0x38,
        },
        init_sequence: &[(0x07, 0x00), (0x2C, 0x00), (0x45, 0x13), (0x58, 0x0F)],
        resolutions: &[75, 150, 300, 600],
        depths: &[8],
        max_width_mm: 216.0,
        max_height_mm: 297.0,
        max_chunk: 16 * 1024,
        calibration: false,
        preview: true,
    },
    ChipsetInfo {
        kind: ChipsetKind::Rts8822,
        chip_id: 0x8822,
        name: "rts8822",
        vendor: "Realtek",
        models: &["HP Scanjet 3800", "HP Scanjet G2710", "UMAX Astra 4900"],
        usb_ids: &[(0x03F0, 0x2605), (0x03F0, 0x2805), (0x06DC, 0x0020)],
        registers: RegisterMap {
            status: 0xB3,
            lamp: 0xE9,
            mode: 0xD0,
            depth: 0xD1,
            resolution: 0xC0,
            start_x: 0xC2,
            start_y: 0xC4,
            pixels: 0xC6,
            lines: 0xC8,
            gain: 0x14,
            offset: 0x15,
        },
        init_sequence: &[(0xE0, 0x00), (0xE9, 0x00), (0xEE, 0x01), (0x00, 0x14)],
        resolutions: &[100, 200, 300, 600, 1200],
        depths: &[8, 16],
        max_width_mm: 220.0,
        max_height_mm: 300.0,
        max_chunk: 48 * 1024,
        calibration: true,
        preview: false,
    },
];

/// Map an identification response to a chipset
///
/// # Errors
///
/// Returns [`Error::UnknownChipset`] for any ID not in [`CHIPSETS`]; there
/// is no fallback entry.
pub fn lookup(chip_id: u16) -> Result<&'static ChipsetInfo> {
    CHIPSETS
        .iter()
        .find(|c| c.chip_id == chip_id)
        .ok_or(Error::UnknownChipset(chip_id))
}

/// Find the chipset for a USB vendor/product pair
pub fn lookup_usb(vendor_id: u16, product_id: u16) -> Option<&'static ChipsetInfo> {
    CHIPSETS
        .iter()
        .find(|c| c.matches_usb_id(vendor_id, product_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table_order_matches_kind() {
        for kind in ChipsetKind::ALL {
            assert_eq!(kind.info().kind, kind);
        }
    }

    #[test]
    fn test_lookup_known_id() {
        let info = lookup(0x0843).unwrap();
        assert_eq!(info.kind, ChipsetKind::Gl843);
        assert_eq!(info.registers.depth, 0x06);
        assert_eq!(info.registers.status, 0x41);
    }

    #[test]
    fn test_lookup_unknown_id() {
        assert_eq!(lookup(0xDEAD).unwrap_err(), Error::UnknownChipset(0xDEAD));
    }

    #[test]
    fn test_chip_ids_unique() {
        for (i, a) in CHIPSETS.iter().enumerate() {
            for b in &CHIPSETS[i + 1..] {
                assert_ne!(a.chip_id, b.chip_id);
            }
        }
    }

    #[test]
    fn test_chunk_fits_frame() {
        for info in &CHIPSETS {
            assert!(info.max_chunk <= crate::frame::MAX_PAYLOAD_SIZE, "{}", info.name);
            assert!(info.resolutions.windows(2).all(|w| w[0] < w[1]), "{}", info.name);
        }
    }

    #[test]
    fn test_model_heuristics() {
        assert!(ChipsetKind::Gl841.info().matches_model("Canon CanoScan LiDE 35"));
        assert!(!ChipsetKind::Gl841.info().matches_model("CanoScan 8600F"));
        assert_eq!(ChipsetKind::from_name("RTS8822"), Some(ChipsetKind::Rts8822));
        assert_eq!(lookup_usb(0x03F0, 0x2605).map(|c| c.kind), Some(ChipsetKind::Rts8822));
    }
}
