//! Register protocol engine over a [`Transport`]

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use scanrust_core::chipset::{self, ChipsetInfo, RegisterMap};
use scanrust_core::constants::{calibration_targets, lamp, mode_codes, status_bits};
use scanrust_core::frame::decode_header;
use scanrust_core::{Command, RequestFrame, ResponseFrame, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use scanrust_transport::Transport;
use scanrust_types::{mm_to_pixels, ColorMode, ErrorKind, ScanParameters};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::lamp::LampGuard;
use crate::config::AdapterConfig;
use crate::error::{Error, Result};

/// One chunk of scan data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub data: Bytes,
    /// Device reported end of data
    pub done: bool,
}

/// Generic chipset protocol engine
///
/// Frames commands, parses responses and sequences the lamp, calibration
/// and scan commands. Chipsets differ only in their [`RegisterMap`], so one
/// adapter drives all of them once [`ProtocolAdapter::identify`] has run.
pub struct ProtocolAdapter {
    transport: Box<dyn Transport>,
    config: AdapterConfig,
    chipset: Option<&'static ChipsetInfo>,
    pub(super) lamp_on: bool,
    pub(super) lamp_off_pending: bool,
    needs_resync: bool,
}

impl ProtocolAdapter {
    /// Wrap a connected transport
    pub fn new(transport: Box<dyn Transport>, config: AdapterConfig) -> Self {
        Self {
            transport,
            config,
            chipset: None,
            lamp_on: false,
            lamp_off_pending: false,
            needs_resync: false,
        }
    }

    /// Chipset found by [`ProtocolAdapter::identify`]
    pub fn chipset(&self) -> Option<&'static ChipsetInfo> {
        self.chipset
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn remote_addr(&self) -> String {
        self.transport.remote_addr()
    }

    /// Lamp state as last commanded
    pub fn lamp_is_on(&self) -> bool {
        self.lamp_on
    }

    /// Send one command and return the response
    ///
    /// Any failure leaves the channel marked for resynchronization: pending
    /// input is discarded before the next command goes out.
    pub async fn transact(&mut self, command: Command, payload: impl Into<Bytes>) -> Result<ResponseFrame> {
        self.settle().await?;

        self.needs_resync = true;
        let response = self.exchange(command, payload.into()).await?;
        self.needs_resync = false;

        if !response.is_success() {
            return Err(scanrust_core::Error::Device {
                command,
                status: response.status,
            }
            .into());
        }
        Ok(response)
    }

    async fn exchange(&mut self, command: Command, payload: Bytes) -> Result<ResponseFrame> {
        let request = RequestFrame::with_payload(command, payload)?;
        trace!("-> {:?}", request);
        self.transport.send(&request.encode()).await?;

        let timeout = self.config.response_timeout;
        let mut frame = match self.transport.read_exact(HEADER_SIZE, timeout).await {
            Ok(header) => header,
            Err(scanrust_transport::Error::ReadTimeout { received: 0, .. }) => {
                return Err(Error::timeout(command.name(), timeout));
            }
            Err(scanrust_transport::Error::ReadTimeout { expected, received }) => {
                return Err(short_read(command, "header", expected, received));
            }
            Err(e) => return Err(e.into()),
        };

        let (_, declared) = decode_header(&frame)?;
        if declared > 0 {
            let payload = match self.transport.read_exact(declared, timeout).await {
                Ok(payload) => payload,
                Err(scanrust_transport::Error::ReadTimeout { expected, received }) => {
                    return Err(short_read(command, "payload", expected, received));
                }
                Err(e) => return Err(e.into()),
            };
            frame.unsplit(payload);
        }

        let response = ResponseFrame::decode(frame)?;
        trace!("<- {:?}", response);
        Ok(response)
    }

    /// Drain stale input and apply a lamp-off left by a dropped guard
    async fn settle(&mut self) -> Result<()> {
        if self.needs_resync {
            let dropped = self.transport.discard_pending().await?;
            debug!("Resynchronized framing, discarded {} byte(s)", dropped);
            self.needs_resync = false;
        }

        if self.lamp_off_pending {
            if let Some(info) = self.chipset {
                self.needs_resync = true;
                let payload = register_payload(info.registers.lamp, &[lamp::OFF]);
                self.exchange(Command::WriteRegister, payload).await?;
                self.needs_resync = false;
                self.lamp_on = false;
            }
            self.lamp_off_pending = false;
        }
        Ok(())
    }

    fn registers(&self) -> Result<&'static RegisterMap> {
        self.chipset
            .map(|info| &info.registers)
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotReady, "chipset not identified"))
    }

    fn chipset_info(&self) -> Result<&'static ChipsetInfo> {
        self.chipset
            .ok_or_else(|| Error::new(ErrorKind::DeviceNotReady, "chipset not identified"))
    }

    /// Read the chip id and map it through the chipset table
    ///
    /// # Errors
    ///
    /// Unknown ids fail with `IncompatibleDevice`. Nothing is written to
    /// the device.
    pub async fn identify(&mut self) -> Result<&'static ChipsetInfo> {
        let response = self.transact(Command::Identify, Bytes::new()).await?;
        let payload = expect_len(Command::Identify, &response.payload, 2)?;
        let chip_id = LittleEndian::read_u16(payload);

        let info = chipset::lookup(chip_id)?;
        info!(
            "Identified {} ({} 0x{:04X}) at {}",
            info.name,
            info.vendor,
            chip_id,
            self.remote_addr()
        );
        self.chipset = Some(info);
        Ok(info)
    }

    pub async fn read_register(&mut self, addr: u16) -> Result<u8> {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u16_le(addr);
        let response = self.transact(Command::ReadRegister, payload.freeze()).await?;
        Ok(expect_len(Command::ReadRegister, &response.payload, 1)?[0])
    }

    pub async fn write_register(&mut self, addr: u16, value: u8) -> Result<()> {
        trace!("reg[0x{:02X}] <- 0x{:02X}", addr, value);
        self.transact(Command::WriteRegister, register_payload(addr, &[value]))
            .await?;
        Ok(())
    }

    pub async fn read_register_word(&mut self, addr: u16) -> Result<u16> {
        let mut payload = BytesMut::with_capacity(2);
        payload.put_u16_le(addr);
        let response = self.transact(Command::ReadRegisterWord, payload.freeze()).await?;
        let word = expect_len(Command::ReadRegisterWord, &response.payload, 2)?;
        Ok(LittleEndian::read_u16(word))
    }

    pub async fn write_register_word(&mut self, addr: u16, value: u16) -> Result<()> {
        trace!("reg[0x{:02X}] <- 0x{:04X}", addr, value);
        self.transact(Command::WriteRegisterWord, register_payload(addr, &value.to_le_bytes()))
            .await?;
        Ok(())
    }

    /// Poll the status register until the READY bit is set
    ///
    /// # Errors
    ///
    /// `Timeout` if the device is not ready within the configured bound.
    pub async fn wait_ready(&mut self) -> Result<()> {
        let status_reg = self.registers()?.status;
        let deadline = Instant::now() + self.config.ready_timeout;

        loop {
            let status = self.read_register(status_reg).await?;
            if status & status_bits::READY != 0 && status & status_bits::BUSY == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout("wait for ready", self.config.ready_timeout));
            }
            tokio::time::sleep(self.config.ready_poll_interval).await;
        }
    }

    /// Write the chipset init sequence and wait for the device to settle
    ///
    /// # Errors
    ///
    /// Any failure is reported as `InitializationError`.
    pub async fn initialize(&mut self) -> Result<()> {
        let info = self.chipset_info()?;
        debug!("Initializing {} ({} register writes)", info.name, info.init_sequence.len());

        let result = async {
            for &(addr, value) in info.init_sequence {
                self.write_register(addr, value).await?;
            }
            self.wait_ready().await
        }
        .await;

        result.map_err(|e| {
            Error::new(
                ErrorKind::InitializationError,
                format!("{} failed to initialize: {e}", info.name),
            )
        })
    }

    /// Switch the lamp
    ///
    /// A failed write may still have reached the device, so any failure
    /// leaves a lamp-off pending for the next command.
    pub async fn set_lamp(&mut self, on: bool) -> Result<()> {
        let reg = self.registers()?.lamp;
        if let Err(e) = self
            .write_register(reg, if on { lamp::ON } else { lamp::OFF })
            .await
        {
            self.lamp_off_pending = true;
            return Err(e);
        }
        self.lamp_on = on;
        Ok(())
    }

    pub(super) async fn capture_reference(&mut self, target: u8) -> Result<()> {
        self.transact(Command::Calibrate, Bytes::copy_from_slice(&[target]))
            .await?;
        Ok(())
    }

    /// White then black reference capture
    ///
    /// The lamp is held on by a [`LampGuard`] for the duration and is off
    /// again on every exit path.
    ///
    /// # Errors
    ///
    /// Any failure is reported as `CalibrationError`.
    pub async fn calibrate(&mut self) -> Result<()> {
        let name = self.chipset_info()?.name;
        let calibration_error =
            |e: Error| Error::new(ErrorKind::CalibrationError, format!("{name} calibration: {e}"));

        let mut guard = LampGuard::acquire(self).await.map_err(calibration_error)?;
        let captured = async {
            guard.capture_reference(calibration_targets::WHITE).await?;
            guard.capture_reference(calibration_targets::BLACK).await
        }
        .await;
        let released = guard.release().await;

        captured.map_err(calibration_error)?;
        released.map_err(calibration_error)?;
        debug!("{} calibrated", name);
        Ok(())
    }

    /// Program the scan registers
    pub async fn configure(&mut self, params: &ScanParameters, gain: u8, offset: u8) -> Result<()> {
        let regs = *self.registers()?;
        let dpi = params.resolution;
        let word = |name: &str, value: u32| {
            u16::try_from(value).map_err(|_| {
                Error::new(
                    ErrorKind::InvalidParameter,
                    format!("{name} {value} does not fit the register"),
                )
            })
        };

        let mode = match params.color_mode {
            ColorMode::Lineart => mode_codes::LINEART,
            ColorMode::Gray => mode_codes::GRAY,
            ColorMode::Color => mode_codes::COLOR,
        };
        let resolution = word("resolution", dpi)?;
        let start_x = word("start x", mm_to_pixels(params.area.left, dpi))?;
        let start_y = word("start y", mm_to_pixels(params.area.top, dpi))?;
        let pixels = word("pixels", mm_to_pixels(params.area.width(), dpi))?;
        let lines = word("lines", mm_to_pixels(params.area.height(), dpi))?;

        self.write_register(regs.mode, mode).await?;
        self.write_register(regs.depth, params.bit_depth).await?;
        self.write_register_word(regs.resolution, resolution).await?;
        self.write_register_word(regs.start_x, start_x).await?;
        self.write_register_word(regs.start_y, start_y).await?;
        self.write_register_word(regs.pixels, pixels).await?;
        self.write_register_word(regs.lines, lines).await?;
        self.write_register(regs.gain, gain).await?;
        self.write_register(regs.offset, offset).await?;

        debug!("Configured {}x{} @ {} dpi", pixels, lines, dpi);
        Ok(())
    }

    /// Lamp on, then start the carriage
    pub async fn start_scan(&mut self) -> Result<()> {
        self.set_lamp(true).await?;
        if let Err(e) = self.transact(Command::StartScan, Bytes::new()).await {
            if let Err(lamp_err) = self.set_lamp(false).await {
                warn!("Lamp off after failed start: {}", lamp_err);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Read up to `max_bytes` of image data, capped by the chipset's
    /// transfer limit
    pub async fn read_data(&mut self, max_bytes: usize) -> Result<DataChunk> {
        let limit = max_bytes
            .min(self.chipset_info()?.max_chunk)
            .min(MAX_PAYLOAD_SIZE)
            .max(1);
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32_le(limit as u32);

        let response = self.transact(Command::ReadData, payload.freeze()).await?;
        if response.payload.len() > limit {
            return Err(scanrust_core::Error::UnexpectedPayload {
                command: Command::ReadData,
                expected: limit,
                actual: response.payload.len(),
            }
            .into());
        }
        Ok(DataChunk {
            done: response.status == scanrust_core::Status::EndOfData,
            data: response.payload,
        })
    }

    /// Stop the carriage; the lamp is turned off even if the stop fails
    pub async fn stop_scan(&mut self) -> Result<()> {
        let stopped = self.transact(Command::StopScan, Bytes::new()).await;
        if let Err(e) = self.set_lamp(false).await {
            warn!("Lamp off after stop failed: {}", e);
        }
        stopped.map(|_| ())
    }

    /// Chip reset; leaves the lamp off
    pub async fn reset(&mut self) -> Result<()> {
        self.needs_resync = true;
        self.transact(Command::Reset, Bytes::new()).await?;
        self.lamp_on = false;
        self.lamp_off_pending = false;
        Ok(())
    }

    /// Best-effort lamp off, then close the transport
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.lamp_on || self.lamp_off_pending {
            if let Err(e) = self.set_lamp(false).await {
                warn!("Lamp off before disconnect: {}", e);
            }
        }
        self.transport.disconnect().await?;
        Ok(())
    }
}

fn register_payload(addr: u16, value: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + value.len());
    payload.put_u16_le(addr);
    payload.put_slice(value);
    payload.freeze()
}

fn expect_len(command: Command, payload: &Bytes, expected: usize) -> Result<&[u8]> {
    if payload.len() != expected {
        return Err(scanrust_core::Error::UnexpectedPayload {
            command,
            expected,
            actual: payload.len(),
        }
        .into());
    }
    Ok(payload)
}

fn short_read(command: Command, part: &str, expected: usize, received: usize) -> Error {
    Error::new(
        ErrorKind::CommunicationError,
        format!("short read in {command} {part}: got {received} of {expected} bytes"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;

    mock! {
        Link {}

        #[async_trait]
        impl Transport for Link {
            async fn connect(&mut self) -> scanrust_transport::Result<()>;
            async fn disconnect(&mut self) -> scanrust_transport::Result<()>;
            fn is_connected(&self) -> bool;
            async fn send(&mut self, data: &[u8]) -> scanrust_transport::Result<()>;
            async fn read_exact(&mut self, len: usize, timeout: Duration) -> scanrust_transport::Result<BytesMut>;
            async fn discard_pending(&mut self) -> scanrust_transport::Result<usize>;
            fn remote_addr(&self) -> String;
        }
    }

    fn adapter(link: MockLink) -> ProtocolAdapter {
        ProtocolAdapter::new(Box::new(link), AdapterConfig::default())
    }

    #[tokio::test]
    async fn test_identify_maps_chip_id() {
        let mut link = MockLink::new();
        link.expect_send().times(1).returning(|_| Ok(()));
        link.expect_read_exact()
            .with(eq(HEADER_SIZE), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(BytesMut::from(&[0x00, 0x02, 0x00][..])));
        link.expect_read_exact()
            .with(eq(2), mockall::predicate::always())
            .times(1)
            .returning(|_, _| Ok(BytesMut::from(&[0x43, 0x08][..])));
        link.expect_remote_addr().returning(|| "mock".into());

        let mut adapter = adapter(link);
        let info = adapter.identify().await.unwrap();
        assert_eq!(info.name, "gl843");
        assert_eq!(adapter.chipset().map(|c| c.chip_id), Some(0x0843));
    }

    #[tokio::test]
    async fn test_short_payload_is_communication_error() {
        let mut link = MockLink::new();
        link.expect_send().returning(|_| Ok(()));
        link.expect_read_exact()
            .with(eq(HEADER_SIZE), mockall::predicate::always())
            .returning(|_, _| Ok(BytesMut::from(&[0x00, 0x02, 0x00][..])));
        link.expect_read_exact()
            .with(eq(2), mockall::predicate::always())
            .returning(|_, _| {
                Err(scanrust_transport::Error::ReadTimeout {
                    expected: 2,
                    received: 1,
                })
            });

        let err = adapter(link).identify().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommunicationError);
    }

    #[tokio::test]
    async fn test_length_mismatch_is_communication_error() {
        let mut link = MockLink::new();
        link.expect_send().returning(|_| Ok(()));
        link.expect_read_exact()
            .with(eq(HEADER_SIZE), mockall::predicate::always())
            .returning(|_, _| Ok(BytesMut::from(&[0x00, 0x02, 0x00][..])));
        link.expect_read_exact()
            .with(eq(2), mockall::predicate::always())
            .returning(|_, _| Ok(BytesMut::from(&[0x43, 0x08, 0xFF][..])));

        let err = adapter(link).identify().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Core(scanrust_core::Error::LengthMismatch { declared: 2, actual: 3 })
        ));
        assert_eq!(err.kind(), ErrorKind::CommunicationError);
    }

    #[tokio::test]
    async fn test_silent_device_is_timeout_and_resyncs() {
        let mut link = MockLink::new();
        link.expect_send().times(2).returning(|_| Ok(()));
        let mut calls = 0;
        link.expect_read_exact().returning(move |len, _| {
            calls += 1;
            match calls {
                1 => Err(scanrust_transport::Error::ReadTimeout {
                    expected: len,
                    received: 0,
                }),
                2 => Ok(BytesMut::from(&[0x00, 0x00, 0x00][..])),
                _ => unreachable!(),
            }
        });
        link.expect_discard_pending().times(1).returning(|| Ok(4));

        let mut adapter = adapter(link);
        let err = adapter.transact(Command::Reset, Bytes::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        adapter.transact(Command::Reset, Bytes::new()).await.unwrap();
    }

    /// Identifies as gl843, times out on the next command, then answers Ok
    fn flaky_after_identify(sent: Arc<parking_lot::Mutex<Vec<RequestFrame>>>) -> MockLink {
        let mut link = MockLink::new();
        link.expect_send().returning(move |data| {
            sent.lock().push(RequestFrame::decode(BytesMut::from(data)).unwrap());
            Ok(())
        });
        let mut calls = 0;
        link.expect_read_exact().returning(move |len, _| {
            calls += 1;
            match calls {
                1 => Ok(BytesMut::from(&[0x00, 0x02, 0x00][..])),
                2 => Ok(BytesMut::from(&[0x43, 0x08][..])),
                3 => Err(scanrust_transport::Error::ReadTimeout {
                    expected: len,
                    received: 0,
                }),
                _ => Ok(BytesMut::from(&[0x00, 0x00, 0x00][..])),
            }
        });
        link.expect_discard_pending().returning(|| Ok(0));
        link.expect_remote_addr().returning(|| "mock".into());
        link
    }

    fn is_lamp_off(frame: &RequestFrame, lamp_reg: u16) -> bool {
        frame.command == Command::WriteRegister
            && frame.payload[..] == register_payload(lamp_reg, &[lamp::OFF])[..]
    }

    #[tokio::test]
    async fn test_failed_lamp_on_in_calibration_schedules_lamp_off() {
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut adapter = adapter(flaky_after_identify(Arc::clone(&sent)));
        adapter.identify().await.unwrap();
        let lamp_reg = adapter.registers().unwrap().lamp;

        let err = adapter.calibrate().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CalibrationError);
        assert!(!adapter.lamp_is_on());
        assert!(adapter.lamp_off_pending);

        adapter.transact(Command::Reset, Bytes::new()).await.unwrap();
        assert!(!adapter.lamp_off_pending);

        let sent = sent.lock();
        assert_eq!(sent.len(), 4);
        assert!(is_lamp_off(&sent[2], lamp_reg));
        assert_eq!(sent[3].command, Command::Reset);
    }

    #[tokio::test]
    async fn test_failed_lamp_on_at_scan_start_schedules_lamp_off() {
        let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut adapter = adapter(flaky_after_identify(Arc::clone(&sent)));
        adapter.identify().await.unwrap();
        let lamp_reg = adapter.registers().unwrap().lamp;

        let err = adapter.start_scan().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(adapter.lamp_off_pending);

        adapter.transact(Command::Reset, Bytes::new()).await.unwrap();
        assert!(sent.lock().iter().any(|frame| is_lamp_off(frame, lamp_reg)));
    }

    #[tokio::test]
    async fn test_unknown_chip_id_is_incompatible() {
        let mut link = MockLink::new();
        link.expect_send().times(1).returning(|_| Ok(()));
        link.expect_read_exact()
            .with(eq(HEADER_SIZE), mockall::predicate::always())
            .returning(|_, _| Ok(BytesMut::from(&[0x00, 0x02, 0x00][..])));
        link.expect_read_exact()
            .with(eq(2), mockall::predicate::always())
            .returning(|_, _| Ok(BytesMut::from(&[0x34, 0x12][..])));

        let mut adapter = adapter(link);
        let err = adapter.identify().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleDevice);
        assert!(adapter.chipset().is_none());
    }

    #[tokio::test]
    async fn test_failure_status_surfaces_kind() {
        let mut link = MockLink::new();
        link.expect_send().returning(|_| Ok(()));
        link.expect_read_exact()
            .returning(|_, _| Ok(BytesMut::from(&[0x02, 0x00, 0x00][..])));

        let err = adapter(link)
            .transact(Command::StartScan, Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceBusy);
    }
}
