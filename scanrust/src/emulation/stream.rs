//! Scan data streaming for emulated devices

use scanrust_types::FrameParameters;

/// Status returned with each read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes delivered, more remain in this frame
    Good,
    /// Frame finished, another follows
    EndOfFrame,
    /// Scan finished
    EndOfStream,
    /// Scan was cancelled
    Cancelled,
}

/// Synthetic multi-frame scan
///
/// Frames are produced on demand from a test pattern: byte `col` of line
/// `line` in frame `f` is `(line + col + f) % 256`.
#[derive(Debug)]
pub(crate) struct ScanStream {
    frames: Vec<FrameParameters>,
    frame: usize,
    offset: u64,
    cancelled: bool,
}

impl ScanStream {
    pub fn new(frames: Vec<FrameParameters>) -> Self {
        Self {
            frames,
            frame: 0,
            offset: 0,
            cancelled: false,
        }
    }

    pub fn current_layout(&self) -> Option<FrameParameters> {
        self.frames.get(self.frame).copied()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn read(&mut self, buf: &mut [u8]) -> (usize, ReadStatus) {
        if self.cancelled {
            return (0, ReadStatus::Cancelled);
        }
        let Some(layout) = self.current_layout() else {
            return (0, ReadStatus::EndOfStream);
        };

        let remaining = layout.frame_bytes() - self.offset;
        if remaining == 0 {
            if self.frame + 1 < self.frames.len() {
                self.frame += 1;
                self.offset = 0;
                return (0, ReadStatus::EndOfFrame);
            }
            return (0, ReadStatus::EndOfStream);
        }

        let n = remaining.min(buf.len() as u64) as usize;
        let bpl = u64::from(layout.bytes_per_line.max(1));
        for (i, byte) in buf[..n].iter_mut().enumerate() {
            let pos = self.offset + i as u64;
            let (line, col) = (pos / bpl, pos % bpl);
            *byte = ((line + col + self.frame as u64) % 256) as u8;
        }
        self.offset += n as u64;
        (n, ReadStatus::Good)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scanrust_types::ColorMode;

    fn layout(last: bool) -> FrameParameters {
        FrameParameters::from_geometry(ColorMode::Gray, 8, 4, 2, last)
    }

    #[test]
    fn test_pattern_and_end_of_stream() {
        let mut stream = ScanStream::new(vec![layout(true)]);
        let mut buf = [0u8; 16];

        assert_eq!(stream.read(&mut buf), (8, ReadStatus::Good));
        assert_eq!(&buf[..8], &[0, 1, 2, 3, 1, 2, 3, 4]);
        assert_eq!(stream.read(&mut buf), (0, ReadStatus::EndOfStream));
        assert_eq!(stream.read(&mut buf), (0, ReadStatus::EndOfStream));
    }

    #[test]
    fn test_frames_advance() {
        let mut stream = ScanStream::new(vec![layout(false), layout(true)]);
        let mut buf = [0u8; 5];

        assert_eq!(stream.read(&mut buf), (5, ReadStatus::Good));
        assert_eq!(stream.read(&mut buf), (3, ReadStatus::Good));
        assert_eq!(stream.read(&mut buf), (0, ReadStatus::EndOfFrame));
        assert!(stream.current_layout().unwrap().last_frame);
        assert_eq!(stream.read(&mut buf), (5, ReadStatus::Good));
        assert_eq!(buf[0], 1);
    }

    #[test]
    fn test_cancel_stops_reads() {
        let mut stream = ScanStream::new(vec![layout(true)]);
        let mut buf = [0u8; 2];
        stream.read(&mut buf);
        stream.cancel();
        assert_eq!(stream.read(&mut buf), (0, ReadStatus::Cancelled));
    }
}
