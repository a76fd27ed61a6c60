//! Per-device session state machine
//!
//! A [`DeviceSession`] owns one [`DeviceHandle`] and enforces the legal
//! order of operations on it. Scans run on a dedicated worker task that
//! takes the handle for the duration of the scan and hands it back when it
//! finishes, so the controller never blocks on device I/O.
//!
//! ```text
//! Closed -> Opening -> Ready <-> Configuring
//!                        |
//!                        v
//!                     Scanning -> Cancelling -> Ready
//! ```
//!
//! `Error` is reachable from any non-terminal state and left only through
//! [`DeviceSession::reset`] or [`DeviceSession::close`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use scanrust_core::{ScanProgress, SessionState, StateTracker};
use scanrust_types::{
    CapabilityDescriptor, DeviceDescriptor, ErrorKind, ErrorRecord, FrameParameters,
    ParameterKind, ParameterValue, ScanParameters, ScannedFrame, ScannedImage,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::driver::{AnyDriver, ReadOutcome, ScannerDriver};
use crate::error::{Error, Result};
use crate::handle::DeviceHandle;

/// Latest-value snapshot published on every state change and chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub progress: ScanProgress,
    /// Most recent failure, cleared when a new scan starts
    pub last_error: Option<ErrorRecord>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Closed,
            progress: ScanProgress::default(),
            last_error: None,
        }
    }
}

/// State shared between the controller and the scan worker
struct Shared {
    tracker: StateTracker,
    cancel: AtomicBool,
    status: watch::Sender<SessionStatus>,
}

impl Shared {
    fn new() -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            tracker: StateTracker::new(),
            cancel: AtomicBool::new(false),
            status,
        }
    }

    fn transition(&self, next: SessionState) -> Result<()> {
        self.tracker.transition(next)?;
        self.publish();
        Ok(())
    }

    /// Move to `next` if legal, ignoring misuse (cleanup paths)
    fn settle(&self, next: SessionState) {
        if self.tracker.state() != next {
            if let Err(e) = self.tracker.transition(next) {
                debug!("Ignoring transition during cleanup: {}", e);
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let state = self.tracker.state();
        let progress = self.tracker.progress();
        self.status.send_modify(|s| {
            s.state = state;
            s.progress = progress;
        });
    }

    fn record_error(&self, error: &Error) {
        let record = error.record();
        self.status.send_modify(|s| s.last_error = Some(record));
    }

    /// State after a failed command: `Ready` if recoverable, `Error` if not
    fn fail(&self, error: &Error) {
        self.record_error(error);
        let next = if error.is_recoverable() {
            SessionState::Ready
        } else {
            SessionState::Error
        };
        self.settle(next);
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// What the worker hands back when a scan ends
struct WorkerExit {
    handle: DeviceHandle,
    result: Result<ScannedImage>,
}

struct SessionInner {
    handle: Option<DeviceHandle>,
    capabilities: Option<CapabilityDescriptor>,
    params: Option<ScanParameters>,
    worker: Option<JoinHandle<WorkerExit>>,
    finished: Option<Result<ScannedImage>>,
}

/// Exclusive session over one open device
///
/// # Examples
///
/// ```no_run
/// use scanrust::{DriverRegistry, ScanArea, ScanParameters, ColorMode};
///
/// # async fn run() -> scanrust::Result<()> {
/// let registry = DriverRegistry::builder().with_emulation_defaults().build();
/// registry.discover().await?;
///
/// let session = registry.open_id("test:0").await?;
/// let params = ScanParameters::new(300, ColorMode::Color, ScanArea::new(0.0, 0.0, 210.0, 297.0));
/// session.configure(&params).await?;
/// session.start_scan().await?;
/// let image = session.wait_for_scan().await?;
/// println!("{} bytes", image.total_bytes());
/// session.close().await;
/// # Ok(())
/// # }
/// ```
pub struct DeviceSession {
    driver: Arc<AnyDriver>,
    descriptor: DeviceDescriptor,
    config: SessionConfig,
    shared: Arc<Shared>,
    inner: tokio::sync::Mutex<SessionInner>,
}

impl DeviceSession {
    /// Create a session in `Closed`
    pub fn new(driver: Arc<AnyDriver>, descriptor: DeviceDescriptor, config: SessionConfig) -> Self {
        Self {
            driver,
            descriptor,
            config,
            shared: Arc::new(Shared::new()),
            inner: tokio::sync::Mutex::new(SessionInner {
                handle: None,
                capabilities: None,
                params: None,
                worker: None,
                finished: None,
            }),
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.tracker.state()
    }

    pub fn progress(&self) -> ScanProgress {
        self.shared.tracker.progress()
    }

    /// Subscribe to status updates; only the latest value is kept
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Open the device and negotiate capabilities
    ///
    /// Bounded by the open timeout. On failure the session returns to
    /// `Closed` and no handle is kept.
    pub async fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.shared.transition(SessionState::Opening)?;
        info!("Opening {} with {}", self.descriptor.id(), self.driver.name());

        match self.open_device().await {
            Ok((handle, capabilities)) => {
                inner.handle = Some(handle);
                inner.capabilities = Some(capabilities);
                inner.params = None;
                inner.finished = None;
                self.shared.transition(SessionState::Ready)?;
                info!("Session ready on {}", self.descriptor.id());
                Ok(())
            }
            Err(e) => {
                warn!("Open of {} failed: {}", self.descriptor.id(), e);
                self.shared.record_error(&e);
                self.shared.settle(SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn open_device(&self) -> Result<(DeviceHandle, CapabilityDescriptor)> {
        let limit = self.config.open_timeout;
        let handle = timeout(limit, self.driver.open(&self.descriptor))
            .await
            .map_err(|_| Error::timeout("open", limit))??;

        // Capabilities are cached driver-side; no device I/O past this point.
        match self.driver.capabilities(&handle).await {
            Ok(capabilities) => Ok((handle, capabilities)),
            Err(e) => {
                if let Err(close_err) = self.driver.close(handle).await {
                    warn!("Close after failed negotiation: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Capability snapshot negotiated at open
    pub async fn capabilities(&self) -> Result<CapabilityDescriptor> {
        let inner = self.inner.lock().await;
        inner
            .capabilities
            .clone()
            .ok_or_else(|| self.misuse(SessionState::Ready))
    }

    /// Parameters applied last, if any
    pub async fn parameters(&self) -> Option<ScanParameters> {
        self.inner.lock().await.params.clone()
    }

    /// Validate and apply scan parameters
    ///
    /// Invalid parameters are rejected with `InvalidParameter` and leave the
    /// session `Ready`.
    pub async fn configure(&self, params: &ScanParameters) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.configure_locked(&mut inner, params).await
    }

    async fn configure_locked(&self, inner: &mut SessionInner, params: &ScanParameters) -> Result<()> {
        self.reclaim(inner).await;
        self.shared.transition(SessionState::Configuring)?;

        let result = self.apply(inner, params).await;
        match &result {
            Ok(()) => {
                inner.params = Some(params.clone());
                self.shared.transition(SessionState::Ready)?;
                debug!("Configured {}: {} dpi {}", self.descriptor.id(), params.resolution, params.color_mode);
            }
            Err(e) => {
                debug!("Configure rejected: {}", e);
                self.shared.fail(e);
            }
        }
        result
    }

    async fn apply(&self, inner: &SessionInner, params: &ScanParameters) -> Result<()> {
        let (Some(handle), Some(capabilities)) = (&inner.handle, &inner.capabilities) else {
            return Err(Error::new(ErrorKind::DeviceNotReady, "session holds no device"));
        };
        capabilities.validate(params)?;

        let limit = self.config.command_timeout;
        timeout(limit, self.driver.apply_parameters(handle, params))
            .await
            .map_err(|_| Error::timeout("configure", limit))?
    }

    /// Start a scan on the worker task
    ///
    /// Applies the capability defaults first if nothing was configured.
    pub async fn start_scan(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.reclaim(&mut inner).await;
        self.shared
            .tracker
            .require(SessionState::Ready, SessionState::Scanning)?;

        let params = match inner.params.clone() {
            Some(params) => params,
            None => {
                let defaults = inner
                    .capabilities
                    .as_ref()
                    .map(CapabilityDescriptor::default_parameters)
                    .ok_or_else(|| self.misuse(SessionState::Scanning))?;
                debug!("No parameters set, using defaults at {} dpi", defaults.resolution);
                self.configure_locked(&mut inner, &defaults).await?;
                defaults
            }
        };

        let Some(handle) = inner.handle.take() else {
            return Err(self.misuse(SessionState::Scanning));
        };

        let limit = self.config.command_timeout;
        let started = timeout(limit, self.driver.start_scan(&handle))
            .await
            .map_err(|_| Error::timeout("start_scan", limit))
            .and_then(|r| r);
        if let Err(e) = started {
            inner.handle = Some(handle);
            warn!("Start on {} failed: {}", self.descriptor.id(), e);
            self.shared.fail(&e);
            return Err(e);
        }

        self.shared.cancel.store(false, Ordering::Release);
        self.shared.status.send_modify(|s| s.last_error = None);
        inner.finished = None;
        self.shared.transition(SessionState::Scanning)?;
        info!("Scan started on {}", self.descriptor.id());

        let worker = ScanWorker {
            driver: Arc::clone(&self.driver),
            shared: Arc::clone(&self.shared),
            config: self.config.clone(),
            params,
            handle,
        };
        inner.worker = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Request cancellation of the running scan
    ///
    /// Never blocks: the session moves to `Cancelling` and the worker stops
    /// at the next chunk boundary, then the session returns to `Ready`.
    pub fn cancel_scan(&self) -> Result<()> {
        self.shared.transition(SessionState::Cancelling)?;
        self.shared.cancel.store(true, Ordering::Release);
        info!("Cancel requested on {}", self.descriptor.id());
        Ok(())
    }

    /// Wait for the running (or last) scan and take its result
    pub async fn wait_for_scan(&self) -> Result<ScannedImage> {
        let mut inner = self.inner.lock().await;
        self.join_worker(&mut inner).await;
        inner.finished.take().unwrap_or_else(|| {
            Err(Error::new(ErrorKind::ScanNotInProgress, "no scan to wait for"))
        })
    }

    /// Force the device back to an idle, initialized state
    ///
    /// Stops a running scan first. Leaves `Error` on success.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.state() == SessionState::Closed {
            return Err(self.misuse(SessionState::Ready));
        }
        if self.state() == SessionState::Scanning {
            self.shared.settle(SessionState::Cancelling);
        }
        self.shared.cancel.store(true, Ordering::Release);
        self.join_worker(&mut inner).await;

        let Some(handle) = &inner.handle else {
            return Err(self.misuse(SessionState::Ready));
        };

        let limit = self.config.command_timeout;
        let result = timeout(limit, self.driver.reset(handle))
            .await
            .map_err(|_| Error::timeout("reset", limit))
            .and_then(|r| r);
        match result {
            Ok(()) => {
                self.shared.settle(SessionState::Ready);
                info!("Reset {}", self.descriptor.id());
                Ok(())
            }
            Err(e) => {
                warn!("Reset of {} failed: {}", self.descriptor.id(), e);
                self.shared.record_error(&e);
                self.shared.settle(SessionState::Error);
                Err(e)
            }
        }
    }

    /// Release the device; idempotent
    ///
    /// Stops any running scan, waits for the worker to hand the handle back
    /// and closes it exactly once. Driver-side failures are logged.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if self.state() == SessionState::Closed && inner.handle.is_none() && inner.worker.is_none() {
            return;
        }

        if self.state() == SessionState::Scanning {
            self.shared.settle(SessionState::Cancelling);
        }
        self.shared.cancel.store(true, Ordering::Release);
        self.join_worker(&mut inner).await;
        inner.finished = None;

        if let Some(handle) = inner.handle.take() {
            let limit = self.config.command_timeout;
            match timeout(limit, self.driver.close(handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Close of {} failed: {}", self.descriptor.id(), e),
                Err(_) => warn!("Close of {} timed out after {:?}", self.descriptor.id(), limit),
            }
        }

        inner.capabilities = None;
        inner.params = None;
        self.shared.settle(SessionState::Closed);
        info!("Closed session on {}", self.descriptor.id());
    }

    /// Names accepted by [`DeviceSession::get_parameter`]
    pub async fn parameter_names(&self) -> Result<Vec<String>> {
        let capabilities = self.capabilities().await?;
        let mut names: Vec<String> = ParameterKind::STANDARD
            .iter()
            .map(|k| k.name().to_string())
            .collect();
        names.extend(capabilities.vendor_options.iter().map(|o| o.name.clone()));
        Ok(names)
    }

    /// Current value of a named parameter
    ///
    /// Falls back to the capability defaults before the first configure.
    pub async fn get_parameter(&self, name: &str) -> Result<ParameterValue> {
        let inner = self.inner.lock().await;
        let params = self.current_params(&inner)?;
        params
            .get(&ParameterKind::from_name(name))
            .ok_or_else(|| Error::new(ErrorKind::InvalidParameter, format!("unknown parameter {name}")))
    }

    /// Set one named parameter and reapply the whole set
    pub async fn set_parameter(&self, name: &str, value: ParameterValue) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut params = self.current_params(&inner)?;
        let kind = ParameterKind::from_name(name);
        if let ParameterKind::Vendor(vendor) = &kind {
            let known = inner
                .capabilities
                .as_ref()
                .is_some_and(|c| c.vendor_option(vendor).is_some());
            if !known {
                return Err(Error::new(ErrorKind::InvalidParameter, format!("unknown parameter {name}")));
            }
        }
        params.set(&kind, value)?;
        self.configure_locked(&mut inner, &params).await
    }

    fn current_params(&self, inner: &SessionInner) -> Result<ScanParameters> {
        match (&inner.params, &inner.capabilities) {
            (Some(params), _) => Ok(params.clone()),
            (None, Some(capabilities)) => Ok(capabilities.default_parameters()),
            (None, None) => Err(self.misuse(SessionState::Ready)),
        }
    }

    /// Take the handle back from a worker that has left `Scanning`
    ///
    /// A worker still scanning is left alone, so the caller's transition
    /// check reports `ScanInProgress` instead of waiting.
    async fn reclaim(&self, inner: &mut SessionInner) {
        if !self.state().is_scanning() {
            self.join_worker(inner).await;
        }
    }

    /// Wait for the worker to finish and take the handle back
    async fn join_worker(&self, inner: &mut SessionInner) {
        let Some(worker) = inner.worker.take() else {
            return;
        };
        match worker.await {
            Ok(exit) => {
                inner.handle = Some(exit.handle);
                inner.finished = Some(exit.result);
            }
            Err(e) => {
                let err = Error::new(ErrorKind::CommunicationError, format!("scan worker failed: {e}"));
                warn!("{}", err);
                self.shared.record_error(&err);
                self.shared.settle(SessionState::Error);
                inner.finished = Some(Err(err));
            }
        }
    }

    fn misuse(&self, target: SessionState) -> Error {
        scanrust_core::Error::InvalidTransition {
            from: self.state(),
            to: target,
        }
        .into()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let handle = inner.handle.take();
        let worker = inner.worker.take();
        if handle.is_none() && worker.is_none() {
            return;
        }

        self.shared.cancel.store(true, Ordering::Release);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Session on {} dropped outside a runtime; device left open", self.descriptor.id());
            return;
        };

        let driver = Arc::clone(&self.driver);
        let id = self.descriptor.id().to_string();
        warn!("Session on {} dropped without close, releasing in background", id);
        runtime.spawn(async move {
            let handle = match (handle, worker) {
                (Some(handle), _) => Some(handle),
                (None, Some(worker)) => worker.await.ok().map(|exit| exit.handle),
                (None, None) => None,
            };
            if let Some(handle) = handle {
                if let Err(e) = driver.close(handle).await {
                    warn!("Background close of {} failed: {}", id, e);
                }
            }
        });
    }
}

/// Scan loop running on its own task
struct ScanWorker {
    driver: Arc<AnyDriver>,
    shared: Arc<Shared>,
    config: SessionConfig,
    params: ScanParameters,
    handle: DeviceHandle,
}

impl ScanWorker {
    async fn run(self) -> WorkerExit {
        let result = match self.stream().await {
            Ok(frames) => {
                self.shared.settle(SessionState::Ready);
                let image = ScannedImage {
                    parameters: self.params.clone(),
                    frames,
                    acquired_at: Utc::now(),
                };
                info!("Scan complete: {} frame(s), {} bytes", image.frames.len(), image.total_bytes());
                Ok(image)
            }
            Err(e) => {
                self.cleanup(&e).await;
                Err(e)
            }
        };

        WorkerExit {
            handle: self.handle,
            result,
        }
    }

    async fn stream(&self) -> Result<Vec<ScannedFrame>> {
        let mut frames = Vec::new();
        let mut layout = self.layout().await?;
        let mut data = allocate(&layout)?;

        loop {
            if self.shared.cancel_requested() {
                return Err(Error::new(ErrorKind::Cancelled, "scan cancelled"));
            }

            let limit = self.config.command_timeout;
            let outcome = timeout(limit, self.driver.read_chunk(&self.handle, self.config.chunk_size))
                .await
                .map_err(|_| Error::timeout("read_chunk", limit))??;

            match outcome {
                ReadOutcome::Data(bytes) => {
                    if (data.len() + bytes.len()) as u64 > layout.frame_bytes() {
                        return Err(Error::new(
                            ErrorKind::DataCorruption,
                            format!("device sent more than the declared {} bytes", layout.frame_bytes()),
                        ));
                    }
                    data.extend_from_slice(&bytes);
                    self.shared.tracker.record_chunk(bytes.len());
                    self.shared.publish();
                }
                ReadOutcome::EndOfFrame => {
                    frames.push(self.finish_frame(layout, data)?);
                    layout = self.layout().await?;
                    data = allocate(&layout)?;
                }
                ReadOutcome::EndOfStream => {
                    frames.push(self.finish_frame(layout, data)?);
                    return Ok(frames);
                }
            }
        }
    }

    async fn layout(&self) -> Result<FrameParameters> {
        let limit = self.config.command_timeout;
        let layout = timeout(limit, self.driver.frame_parameters(&self.handle))
            .await
            .map_err(|_| Error::timeout("frame_parameters", limit))??;
        self.shared.tracker.set_expected_bytes(layout.frame_bytes());
        Ok(layout)
    }

    fn finish_frame(&self, layout: FrameParameters, data: Vec<u8>) -> Result<ScannedFrame> {
        if data.len() as u64 != layout.frame_bytes() {
            return Err(Error::new(
                ErrorKind::DataCorruption,
                format!("frame ended at {} of {} bytes", data.len(), layout.frame_bytes()),
            ));
        }
        self.shared.tracker.record_frame();
        self.shared.publish();
        Ok(ScannedFrame {
            layout,
            data: Bytes::from(data),
        })
    }

    /// Stop the device after a failed or cancelled scan
    ///
    /// Tries a cancel first and falls back to a reset, so the session never
    /// hangs in `Cancelling`.
    async fn cleanup(&self, error: &Error) {
        let limit = self.config.cancel_timeout;
        let stopped = match timeout(limit, self.driver.cancel_scan(&self.handle)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Cancel failed, resetting: {}", e);
                false
            }
            Err(_) => {
                warn!("Cancel not confirmed within {:?}, resetting", limit);
                false
            }
        };

        let stopped = stopped
            || match timeout(self.config.command_timeout, self.driver.reset(&self.handle)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!("Reset after failed cancel also failed: {}", e);
                    false
                }
                Err(_) => false,
            };

        if error.kind() == ErrorKind::Cancelled {
            info!("Scan cancelled");
        } else {
            warn!("Scan failed: {}", error);
        }

        if stopped {
            self.shared.fail(error);
        } else {
            self.shared.record_error(error);
            self.shared.settle(SessionState::Error);
        }
    }
}

fn allocate(layout: &FrameParameters) -> Result<Vec<u8>> {
    let bytes = usize::try_from(layout.frame_bytes())
        .map_err(|_| Error::new(ErrorKind::OutOfMemory, "frame exceeds address space"))?;
    let mut data = Vec::new();
    data.try_reserve_exact(bytes).map_err(|_| {
        Error::new(ErrorKind::OutOfMemory, format!("cannot buffer a {bytes} byte frame"))
    })?;
    Ok(data)
}
