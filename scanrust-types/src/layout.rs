//! Frame layout and completed scan buffers

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::parameters::{ColorMode, MM_PER_INCH, ScanParameters};

/// Sample arrangement of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    /// Single channel (lineart or gray)
    Gray,
    /// Interleaved red, green, blue
    Rgb,
}

/// Geometry of one frame as delivered to image processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameParameters {
    pub format: FrameFormat,
    /// No further frames follow in this scan
    pub last_frame: bool,
    pub bytes_per_line: u32,
    pub pixels_per_line: u32,
    pub lines: u32,
    pub depth: u8,
}

impl FrameParameters {
    /// Derive the layout of a frame from negotiated parameters
    ///
    /// Pixel counts truncate toward zero. 1-bit lines are padded to whole
    /// bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use scanrust_types::{ColorMode, FrameParameters, ScanArea, ScanParameters};
    ///
    /// let params = ScanParameters::new(300, ColorMode::Color, ScanArea::new(0.0, 0.0, 210.0, 297.0));
    /// let layout = FrameParameters::for_parameters(&params, true);
    /// assert_eq!(layout.pixels_per_line, 2480);
    /// assert_eq!(layout.lines, 3507);
    /// assert_eq!(layout.bytes_per_line, 2480 * 3);
    /// ```
    pub fn for_parameters(params: &ScanParameters, last_frame: bool) -> Self {
        let pixels_per_line = mm_to_pixels(params.area.width(), params.resolution);
        let lines = mm_to_pixels(params.area.height(), params.resolution);
        Self::from_geometry(params.color_mode, params.bit_depth, pixels_per_line, lines, last_frame)
    }

    /// Layout for explicit pixel geometry
    pub fn from_geometry(
        mode: ColorMode,
        depth: u8,
        pixels_per_line: u32,
        lines: u32,
        last_frame: bool,
    ) -> Self {
        let format = match mode {
            ColorMode::Color => FrameFormat::Rgb,
            ColorMode::Gray | ColorMode::Lineart => FrameFormat::Gray,
        };
        let bits_per_line = u64::from(pixels_per_line) * u64::from(mode.channels()) * u64::from(depth);
        let bytes_per_line = bits_per_line.div_ceil(8) as u32;

        Self {
            format,
            last_frame,
            bytes_per_line,
            pixels_per_line,
            lines,
            depth,
        }
    }

    /// Total bytes in the frame
    pub fn frame_bytes(&self) -> u64 {
        u64::from(self.bytes_per_line) * u64::from(self.lines)
    }
}

impl fmt::Display for FrameParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}x{} @{}bit ({} B/line)",
            self.format, self.pixels_per_line, self.lines, self.depth, self.bytes_per_line
        )
    }
}

/// Convert a length in millimetres to pixels at `dpi`
pub fn mm_to_pixels(mm: f64, dpi: u32) -> u32 {
    if !mm.is_finite() || mm <= 0.0 {
        return 0;
    }
    (mm / MM_PER_INCH * f64::from(dpi)) as u32
}

/// One delivered frame
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedFrame {
    pub layout: FrameParameters,
    /// Exactly `layout.frame_bytes()` bytes
    pub data: Bytes,
}

/// Completed scan handed to image processing
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedImage {
    pub parameters: ScanParameters,
    pub frames: Vec<ScannedFrame>,
    pub acquired_at: DateTime<Utc>,
}

impl ScannedImage {
    pub fn total_bytes(&self) -> u64 {
        self.frames.iter().map(|f| f.data.len() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::ScanArea;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lineart_pads_to_bytes() {
        let layout = FrameParameters::from_geometry(ColorMode::Lineart, 1, 10, 4, true);
        assert_eq!(layout.bytes_per_line, 2);
        assert_eq!(layout.frame_bytes(), 8);
    }

    #[test]
    fn test_sixteen_bit_color() {
        let layout = FrameParameters::from_geometry(ColorMode::Color, 16, 100, 10, true);
        assert_eq!(layout.format, FrameFormat::Rgb);
        assert_eq!(layout.bytes_per_line, 600);
    }

    #[test]
    fn test_gray_a4_at_150() {
        let params = ScanParameters::new(150, ColorMode::Gray, ScanArea::new(0.0, 0.0, 210.0, 297.0));
        let layout = FrameParameters::for_parameters(&params, false);
        assert_eq!(layout.pixels_per_line, 1240);
        assert_eq!(layout.lines, 1753);
        assert_eq!(layout.frame_bytes(), 1240 * 1753);
        assert!(!layout.last_frame);
    }

    #[test]
    fn test_mm_to_pixels_degenerate() {
        assert_eq!(mm_to_pixels(-1.0, 300), 0);
        assert_eq!(mm_to_pixels(f64::INFINITY, 300), 0);
        assert_eq!(mm_to_pixels(25.4, 600), 600);
    }
}
