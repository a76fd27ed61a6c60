//! In-memory chipset simulator
//!
//! [`SimulatedScanner`] answers the register protocol the way a real
//! chipset would, and records what the host did to it (register writes,
//! lamp state, resets, calibrations). [`SimulatedTransport`] carries frames
//! to it without any I/O, and [`SimulatedConnector`] hands those transports
//! to a [`HardwareDriver`](super::HardwareDriver).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use scanrust_core::chipset::ChipsetInfo;
use scanrust_core::constants::{lamp, mode_codes, status_bits};
use scanrust_core::{ChipsetKind, Command, RequestFrame, ResponseFrame, Status};
use scanrust_transport::Transport;
use scanrust_types::{ColorMode, DeviceDescriptor, ErrorKind, FrameParameters, TransportKind};
use tracing::{debug, trace};

use super::connector::Connector;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct SimScan {
    remaining: u64,
    position: u64,
    chunks: u64,
}

#[derive(Debug)]
struct SimState {
    kind: ChipsetKind,
    chip_id: u16,
    registers: HashMap<u16, u16>,
    writes: Vec<(u16, u16)>,
    lamp_on: bool,
    resets: u32,
    calibrations: u32,
    scans_started: u32,
    scan: Option<SimScan>,
    never_ready: bool,
    silent_writes: bool,
    fail_calibration: bool,
    stall_on_chunk: Option<u64>,
}

impl SimState {
    fn info(&self) -> &'static ChipsetInfo {
        self.kind.info()
    }

    fn status_bits(&self) -> u8 {
        let mut bits = status_bits::HOME;
        if self.never_ready {
            bits |= status_bits::BUSY;
        } else {
            bits |= status_bits::READY;
        }
        if self.lamp_on {
            bits |= status_bits::LAMP;
        }
        bits
    }

    fn write(&mut self, addr: u16, value: u16) {
        self.writes.push((addr, value));
        self.registers.insert(addr, value);
        if addr == self.info().registers.lamp {
            self.lamp_on = value as u8 == lamp::ON;
        }
    }

    fn reg(&self, addr: u16) -> u16 {
        self.registers.get(&addr).copied().unwrap_or(0)
    }

    /// Bytes the programmed geometry will produce
    fn programmed_bytes(&self) -> u64 {
        let regs = &self.info().registers;
        let mode = match self.reg(regs.mode) as u8 {
            mode_codes::LINEART => ColorMode::Lineart,
            mode_codes::COLOR => ColorMode::Color,
            _ => ColorMode::Gray,
        };
        FrameParameters::from_geometry(
            mode,
            self.reg(regs.depth) as u8,
            u32::from(self.reg(regs.pixels)),
            u32::from(self.reg(regs.lines)),
            true,
        )
        .frame_bytes()
    }

    fn handle(&mut self, request: RequestFrame) -> Option<ResponseFrame> {
        let payload = &request.payload;
        let reply = |status: Status| Some(ResponseFrame::new(status));
        let reply_with = |payload: Vec<u8>| {
            Some(ResponseFrame::with_payload(Status::Ok, payload).unwrap_or_else(|_| ResponseFrame::new(Status::DeviceError)))
        };

        if self.silent_writes
            && matches!(request.command, Command::WriteRegister | Command::WriteRegisterWord)
        {
            debug!("Simulator ignoring {}", request.command);
            return None;
        }

        match request.command {
            Command::Identify => reply_with(self.chip_id.to_le_bytes().to_vec()),
            Command::ReadRegister | Command::ReadRegisterWord => {
                if payload.len() != 2 {
                    return reply(Status::InvalidArgument);
                }
                let addr = LittleEndian::read_u16(payload);
                let value = if addr == self.info().registers.status {
                    u16::from(self.status_bits())
                } else {
                    self.reg(addr)
                };
                match request.command {
                    Command::ReadRegister => reply_with(vec![value as u8]),
                    _ => reply_with(value.to_le_bytes().to_vec()),
                }
            }
            Command::WriteRegister => {
                if payload.len() != 3 {
                    return reply(Status::InvalidArgument);
                }
                self.write(LittleEndian::read_u16(payload), u16::from(payload[2]));
                reply(Status::Ok)
            }
            Command::WriteRegisterWord => {
                if payload.len() != 4 {
                    return reply(Status::InvalidArgument);
                }
                self.write(LittleEndian::read_u16(payload), LittleEndian::read_u16(&payload[2..]));
                reply(Status::Ok)
            }
            Command::Calibrate => {
                if !self.lamp_on || self.fail_calibration {
                    return reply(Status::DeviceError);
                }
                self.calibrations += 1;
                reply(Status::Ok)
            }
            Command::StartScan => {
                if self.scan.is_some() {
                    return reply(Status::Busy);
                }
                if !self.lamp_on {
                    return reply(Status::NotReady);
                }
                self.scans_started += 1;
                self.scan = Some(SimScan {
                    remaining: self.programmed_bytes(),
                    ..Default::default()
                });
                reply(Status::Ok)
            }
            Command::ReadData => {
                if payload.len() != 4 {
                    return reply(Status::InvalidArgument);
                }
                let max = u64::from(LittleEndian::read_u32(payload));
                let stall = self.stall_on_chunk;
                let Some(scan) = self.scan.as_mut() else {
                    return reply(Status::InvalidArgument);
                };

                scan.chunks += 1;
                if stall == Some(scan.chunks) {
                    debug!("Simulator stalling on chunk {}", scan.chunks);
                    self.stall_on_chunk = None;
                    return None;
                }
                if scan.remaining == 0 {
                    self.scan = None;
                    return reply(Status::EndOfData);
                }

                let n = scan.remaining.min(max);
                let data: Vec<u8> = (scan.position..scan.position + n)
                    .map(|i| (i % 251) as u8)
                    .collect();
                scan.position += n;
                scan.remaining -= n;
                reply_with(data)
            }
            Command::StopScan => {
                self.scan = None;
                reply(Status::Ok)
            }
            Command::Reset => {
                self.resets += 1;
                self.scan = None;
                self.lamp_on = false;
                reply(Status::Ok)
            }
        }
    }
}

/// Simulated chipset, shared between the test and its transports
#[derive(Debug, Clone)]
pub struct SimulatedScanner {
    state: Arc<parking_lot::Mutex<SimState>>,
}

impl SimulatedScanner {
    pub fn new(kind: ChipsetKind) -> Self {
        Self {
            state: Arc::new(parking_lot::Mutex::new(SimState {
                kind,
                chip_id: kind.info().chip_id,
                registers: HashMap::new(),
                writes: Vec::new(),
                lamp_on: false,
                resets: 0,
                calibrations: 0,
                scans_started: 0,
                scan: None,
                never_ready: false,
                silent_writes: false,
                fail_calibration: false,
                stall_on_chunk: None,
            })),
        }
    }

    /// Answer identification with `chip_id` instead of the chipset's own
    pub fn with_chip_id(self, chip_id: u16) -> Self {
        self.state.lock().chip_id = chip_id;
        self
    }

    /// Never raise the READY bit
    pub fn never_ready(self) -> Self {
        self.set_never_ready(true);
        self
    }

    /// Hold the READY bit low until cleared again
    pub fn set_never_ready(&self, stuck: bool) {
        self.state.lock().never_ready = stuck;
    }

    /// Drop register writes without applying or answering them
    pub fn set_silent_writes(&self, silent: bool) {
        self.state.lock().silent_writes = silent;
    }

    /// Swallow the `n`th data request of the next scan (one-shot)
    pub fn stall_on_chunk(self, n: u64) -> Self {
        self.state.lock().stall_on_chunk = Some(n);
        self
    }

    /// Reject every calibration command
    pub fn fail_calibration(self) -> Self {
        self.state.lock().fail_calibration = true;
        self
    }

    pub fn chipset(&self) -> ChipsetKind {
        self.state.lock().kind
    }

    /// Descriptor routed to the driver for this chipset
    pub fn descriptor(&self, id: &str) -> DeviceDescriptor {
        let kind = self.chipset();
        let info = kind.info();
        DeviceDescriptor::new(
            id,
            info.vendor,
            info.models.first().copied().unwrap_or(info.name),
            TransportKind::Usb,
            format!("sim:{id}"),
        )
        .with_driver_hint(super::driver_name(kind))
    }

    pub fn lamp_on(&self) -> bool {
        self.state.lock().lamp_on
    }

    /// Every register write, in order, as `(address, value)`
    pub fn register_writes(&self) -> Vec<(u16, u16)> {
        self.state.lock().writes.clone()
    }

    pub fn register(&self, addr: u16) -> Option<u16> {
        self.state.lock().registers.get(&addr).copied()
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().resets
    }

    pub fn calibrations(&self) -> u32 {
        self.state.lock().calibrations
    }

    pub fn scans_started(&self) -> u32 {
        self.state.lock().scans_started
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scan.is_some()
    }

    /// Process one encoded request; `None` means the device stays silent
    pub fn process(&self, request: &[u8]) -> Option<Bytes> {
        let response = match RequestFrame::decode(BytesMut::from(request)) {
            Ok(request) => {
                trace!("sim <- {:?}", request);
                self.state.lock().handle(request)?
            }
            Err(e) => {
                debug!("Simulator rejected malformed request: {}", e);
                ResponseFrame::new(Status::InvalidArgument)
            }
        };
        Some(response.encode().freeze())
    }
}

/// In-memory [`Transport`] to a [`SimulatedScanner`]
pub struct SimulatedTransport {
    scanner: SimulatedScanner,
    address: String,
    connected: bool,
    inbox: BytesMut,
}

impl SimulatedTransport {
    pub fn new(scanner: SimulatedScanner, address: impl Into<String>) -> Self {
        Self {
            scanner,
            address: address.into(),
            connected: false,
            inbox: BytesMut::new(),
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&mut self) -> scanrust_transport::Result<()> {
        if self.connected {
            return Err(scanrust_transport::Error::AlreadyConnected);
        }
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> scanrust_transport::Result<()> {
        self.connected = false;
        self.inbox.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, data: &[u8]) -> scanrust_transport::Result<()> {
        if !self.connected {
            return Err(scanrust_transport::Error::NotConnected);
        }
        if let Some(response) = self.scanner.process(data) {
            self.inbox.extend_from_slice(&response);
        }
        Ok(())
    }

    async fn read_exact(&mut self, len: usize, timeout: Duration) -> scanrust_transport::Result<BytesMut> {
        if !self.connected {
            return Err(scanrust_transport::Error::NotConnected);
        }
        if self.inbox.len() >= len {
            return Ok(self.inbox.split_to(len));
        }
        tokio::time::sleep(timeout).await;
        Err(scanrust_transport::Error::ReadTimeout {
            expected: len,
            received: self.inbox.len(),
        })
    }

    async fn discard_pending(&mut self) -> scanrust_transport::Result<usize> {
        let n = self.inbox.len();
        self.inbox.clear();
        Ok(n)
    }

    fn remote_addr(&self) -> String {
        self.address.clone()
    }
}

/// [`Connector`] serving simulated scanners by descriptor id
#[derive(Default)]
pub struct SimulatedConnector {
    devices: parking_lot::Mutex<Vec<(DeviceDescriptor, SimulatedScanner)>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `scanner` under `id`, returning its descriptor
    pub fn attach(&self, id: &str, scanner: SimulatedScanner) -> DeviceDescriptor {
        let descriptor = scanner.descriptor(id);
        self.devices.lock().push((descriptor.clone(), scanner));
        descriptor
    }

    pub fn with_device(self, id: &str, scanner: SimulatedScanner) -> Self {
        self.attach(id, scanner);
        self
    }

    /// Unplug the device with `id`
    pub fn detach(&self, id: &str) -> bool {
        let mut devices = self.devices.lock();
        let before = devices.len();
        devices.retain(|(d, _)| d.id() != id);
        devices.len() != before
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn enumerate(&self, chipset: ChipsetKind) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .devices
            .lock()
            .iter()
            .filter(|(_, scanner)| scanner.chipset() == chipset)
            .map(|(d, _)| d.clone())
            .collect())
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<Box<dyn Transport>> {
        let scanner = self
            .devices
            .lock()
            .iter()
            .find(|(d, _)| d.id() == descriptor.id())
            .map(|(_, s)| s.clone())
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::DeviceNotFound,
                    format!("no simulated device {}", descriptor.id()),
                )
            })?;

        let mut transport = SimulatedTransport::new(scanner, descriptor.connection_address());
        transport.connect().await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(command: Command, payload: &[u8]) -> Vec<u8> {
        RequestFrame::with_payload(command, payload.to_vec())
            .unwrap()
            .encode()
            .to_vec()
    }

    fn response(raw: Bytes) -> ResponseFrame {
        ResponseFrame::decode(BytesMut::from(&raw[..])).unwrap()
    }

    #[test]
    fn test_identify_and_status() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841);
        let id = response(sim.process(&request(Command::Identify, &[])).unwrap());
        assert_eq!(&id.payload[..], &[0x41, 0x08]);

        let status = response(sim.process(&request(Command::ReadRegister, &[0x41, 0x00])).unwrap());
        assert_eq!(status.payload[0] & status_bits::READY, status_bits::READY);
    }

    #[test]
    fn test_lamp_tracks_register() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841);
        sim.process(&request(Command::WriteRegister, &[0x03, 0x00, lamp::ON]));
        assert!(sim.lamp_on());
        assert_eq!(sim.register_writes(), vec![(0x03, 1)]);
    }

    #[test]
    fn test_scan_serves_programmed_bytes() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841);
        let regs = ChipsetKind::Gl841.info().registers;
        sim.process(&request(Command::WriteRegister, &[regs.mode as u8, 0, mode_codes::GRAY]));
        sim.process(&request(Command::WriteRegister, &[regs.depth as u8, 0, 8]));
        sim.process(&request(Command::WriteRegisterWord, &[regs.pixels as u8, 0, 10, 0]));
        sim.process(&request(Command::WriteRegisterWord, &[regs.lines as u8, 0, 3, 0]));
        sim.process(&request(Command::WriteRegister, &[regs.lamp as u8, 0, lamp::ON]));
        assert_eq!(response(sim.process(&request(Command::StartScan, &[])).unwrap()).status, Status::Ok);

        let first = response(sim.process(&request(Command::ReadData, &[16, 0, 0, 0])).unwrap());
        let second = response(sim.process(&request(Command::ReadData, &[16, 0, 0, 0])).unwrap());
        let end = response(sim.process(&request(Command::ReadData, &[16, 0, 0, 0])).unwrap());
        assert_eq!(first.payload.len(), 16);
        assert_eq!(second.payload.len(), 14);
        assert_eq!(end.status, Status::EndOfData);
        assert!(!sim.is_scanning());
    }

    #[test]
    fn test_start_without_lamp_not_ready() {
        let sim = SimulatedScanner::new(ChipsetKind::Lm9831);
        let res = response(sim.process(&request(Command::StartScan, &[])).unwrap());
        assert_eq!(res.status, Status::NotReady);
    }

    #[test]
    fn test_stall_is_one_shot() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841).stall_on_chunk(1);
        sim.process(&request(Command::WriteRegister, &[0x03, 0x00, lamp::ON]));
        sim.process(&request(Command::StartScan, &[]));

        assert!(sim.process(&request(Command::ReadData, &[1, 0, 0, 0])).is_none());
        assert!(sim.process(&request(Command::ReadData, &[1, 0, 0, 0])).is_some());
    }

    #[test]
    fn test_silent_writes_are_not_applied() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841);
        sim.set_silent_writes(true);
        assert!(sim.process(&request(Command::WriteRegister, &[0x03, 0x00, lamp::ON])).is_none());
        assert!(sim.register_writes().is_empty());
        assert!(sim.process(&request(Command::Identify, &[])).is_some());

        sim.set_silent_writes(false);
        assert!(sim.process(&request(Command::WriteRegister, &[0x03, 0x00, lamp::ON])).is_some());
        assert_eq!(sim.register_writes().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_times_out_when_silent() {
        let sim = SimulatedScanner::new(ChipsetKind::Gl841);
        let mut transport = SimulatedTransport::new(sim, "sim:0");
        transport.connect().await.unwrap();

        let err = transport
            .read_exact(3, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        transport.send(&request(Command::Identify, &[])).await.unwrap();
        let header = transport.read_exact(3, Duration::from_millis(5)).await.unwrap();
        assert_eq!(&header[..], &[0x00, 0x02, 0x00]);
        assert_eq!(transport.discard_pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_connector_serves_attached_devices() {
        let connector = SimulatedConnector::new();
        let desc = connector.attach("sim0", SimulatedScanner::new(ChipsetKind::Gl846));

        assert_eq!(connector.enumerate(ChipsetKind::Gl846).await.unwrap(), vec![desc.clone()]);
        assert!(connector.enumerate(ChipsetKind::Gl841).await.unwrap().is_empty());
        assert!(connector.connect(&desc).await.is_ok());

        assert!(connector.detach("sim0"));
        assert!(connector.connect(&desc).await.is_err());
    }
}
