//! Session lifecycle state and scan progress tracking
//!
//! A tracker records:
//! - Current lifecycle state (legal transitions only)
//! - Progress counters for the running scan
//! - Number of scans started since open
//!
//! Thread-safe and cloned cheaply (Arc internally), so the session's scan
//! worker and its controller observe the same counters.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use scanrust_types::ErrorKind;

use crate::error::{Error, Result};

/// Device session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No device handle held
    Closed,

    /// Connecting, identifying, initializing
    Opening,

    /// Idle with a valid handle
    Ready,

    /// Applying parameters
    Configuring,

    /// Worker task streaming data
    Scanning,

    /// Cancel requested, waiting for the device to stop
    Cancelling,

    /// Unrecoverable failure; leave via reset or close
    Error,
}

impl SessionState {
    /// Check whether `next` is a legal successor
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Closed, Opening) => true,
            (Opening, Ready | Closed | Error) => true,
            (Ready, Configuring | Scanning | Error | Closed) => true,
            (Configuring, Ready | Error | Closed) => true,
            (Scanning, Ready | Cancelling | Error | Closed) => true,
            (Cancelling, Ready | Error | Closed) => true,
            (Error, Ready | Closed) => true,
            _ => false,
        }
    }

    /// Handle is held in every state but `Closed`
    pub fn holds_handle(self) -> bool {
        !matches!(self, Self::Closed)
    }

    pub fn is_scanning(self) -> bool {
        matches!(self, Self::Scanning | Self::Cancelling)
    }

    /// Error kind reported when moving from `self` to `next` is illegal
    pub fn misuse_kind(self, next: SessionState) -> ErrorKind {
        match (self, next) {
            (Self::Scanning | Self::Cancelling, _) => ErrorKind::ScanInProgress,
            (_, Self::Cancelling) => ErrorKind::ScanNotInProgress,
            (Self::Closed, _) => ErrorKind::DeviceNotFound,
            _ => ErrorKind::DeviceNotReady,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Ready => "ready",
            Self::Configuring => "configuring",
            Self::Scanning => "scanning",
            Self::Cancelling => "cancelling",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of scan progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanProgress {
    /// Bytes received in the current scan
    pub bytes: u64,
    /// Data chunks received in the current scan
    pub chunks: u64,
    /// Frames completed in the current scan
    pub frames: u32,
    /// Expected bytes for the current frame, when known
    pub expected_bytes: u64,
}

/// Shared lifecycle state tracker
#[derive(Debug, Clone)]
pub struct StateTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    state: parking_lot::RwLock<SessionState>,
    bytes: AtomicU64,
    chunks: AtomicU64,
    frames: AtomicU32,
    expected_bytes: AtomicU64,
    scans: AtomicU64,
}

impl StateTracker {
    /// Create a tracker in `Closed`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                state: parking_lot::RwLock::new(SessionState::Closed),
                bytes: AtomicU64::new(0),
                chunks: AtomicU64::new(0),
                frames: AtomicU32::new(0),
                expected_bytes: AtomicU64::new(0),
                scans: AtomicU64::new(0),
            }),
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    /// Move to `next`, returning the previous state
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if `next` is not a legal
    /// successor; the state is left unchanged.
    pub fn transition(&self, next: SessionState) -> Result<SessionState> {
        let mut state = self.inner.state.write();
        let from = *state;

        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }

        if next == SessionState::Scanning {
            self.reset_progress();
            self.inner.scans.fetch_add(1, Ordering::AcqRel);
        }

        *state = next;
        Ok(from)
    }

    /// Check that the current state is `expected` without changing it
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] describing the attempted move to
    /// `target` when the state differs.
    pub fn require(&self, expected: SessionState, target: SessionState) -> Result<()> {
        let state = self.state();
        if state != expected {
            return Err(Error::InvalidTransition {
                from: state,
                to: target,
            });
        }
        Ok(())
    }

    /// Record one received chunk
    pub fn record_chunk(&self, len: usize) {
        self.inner.bytes.fetch_add(len as u64, Ordering::AcqRel);
        self.inner.chunks.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a completed frame
    pub fn record_frame(&self) {
        self.inner.frames.fetch_add(1, Ordering::AcqRel);
    }

    /// Set the byte count expected for the frame being read
    pub fn set_expected_bytes(&self, bytes: u64) {
        self.inner.expected_bytes.store(bytes, Ordering::Release);
    }

    /// Current progress snapshot
    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            bytes: self.inner.bytes.load(Ordering::Acquire),
            chunks: self.inner.chunks.load(Ordering::Acquire),
            frames: self.inner.frames.load(Ordering::Acquire),
            expected_bytes: self.inner.expected_bytes.load(Ordering::Acquire),
        }
    }

    /// Scans started since the tracker was created
    pub fn scans_started(&self) -> u64 {
        self.inner.scans.load(Ordering::Acquire)
    }

    fn reset_progress(&self) {
        self.inner.bytes.store(0, Ordering::Release);
        self.inner.chunks.store(0, Ordering::Release);
        self.inner.frames.store(0, Ordering::Release);
        self.inner.expected_bytes.store(0, Ordering::Release);
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn opened() -> StateTracker {
        let tracker = StateTracker::new();
        tracker.transition(SessionState::Opening).unwrap();
        tracker.transition(SessionState::Ready).unwrap();
        tracker
    }

    #[test]
    fn test_tracker_new() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.state(), SessionState::Closed);
        assert!(!tracker.state().holds_handle());
        assert_eq!(tracker.progress(), ScanProgress::default());
    }

    #[test]
    fn test_open_configure_scan_cycle() {
        let tracker = opened();
        tracker.transition(SessionState::Configuring).unwrap();
        tracker.transition(SessionState::Ready).unwrap();
        tracker.transition(SessionState::Scanning).unwrap();
        tracker.transition(SessionState::Cancelling).unwrap();
        tracker.transition(SessionState::Ready).unwrap();
        assert_eq!(tracker.scans_started(), 1);
    }

    #[test]
    fn test_configure_while_scanning_is_scan_in_progress() {
        let tracker = opened();
        tracker.transition(SessionState::Scanning).unwrap();

        let err = tracker.transition(SessionState::Configuring).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScanInProgress);
        assert_eq!(tracker.state(), SessionState::Scanning);
    }

    #[test]
    fn test_cancel_when_idle_is_scan_not_in_progress() {
        let tracker = opened();
        let err = tracker.transition(SessionState::Cancelling).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScanNotInProgress);
    }

    #[test]
    fn test_error_state_exits() {
        let tracker = opened();
        tracker.transition(SessionState::Error).unwrap();
        assert!(tracker.transition(SessionState::Scanning).is_err());
        assert!(tracker.transition(SessionState::Configuring).is_err());
        tracker.transition(SessionState::Ready).unwrap();
    }

    #[test]
    fn test_closed_is_only_left_by_opening() {
        for next in [
            SessionState::Ready,
            SessionState::Configuring,
            SessionState::Scanning,
            SessionState::Cancelling,
            SessionState::Error,
        ] {
            assert!(!SessionState::Closed.can_transition_to(next));
        }
    }

    #[test]
    fn test_progress_resets_per_scan() {
        let tracker = opened();
        tracker.transition(SessionState::Scanning).unwrap();
        tracker.record_chunk(100);
        tracker.record_chunk(50);
        tracker.record_frame();
        assert_eq!(tracker.progress().bytes, 150);
        assert_eq!(tracker.progress().chunks, 2);

        tracker.transition(SessionState::Ready).unwrap();
        tracker.transition(SessionState::Scanning).unwrap();
        assert_eq!(tracker.progress(), ScanProgress::default());
        assert_eq!(tracker.scans_started(), 2);
    }

    #[test]
    fn test_tracker_clone_shares_state() {
        let tracker1 = opened();
        let tracker2 = tracker1.clone();

        tracker1.transition(SessionState::Scanning).unwrap();
        tracker1.record_chunk(10);
        assert_eq!(tracker2.state(), SessionState::Scanning);
        assert_eq!(tracker2.progress().bytes, 10);
    }
}
