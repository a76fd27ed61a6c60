//! Register-protocol command and status codes

use std::fmt;

use crate::error::{Error, Result};

/// Request command codes
///
/// Sent as the first byte of every request frame. Chipsets share the command
/// set and differ only in their register maps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    // Identification
    Identify = 0x01,

    // Register access
    ReadRegister = 0x10,
    WriteRegister = 0x11,
    ReadRegisterWord = 0x12,
    WriteRegisterWord = 0x13,

    // Shading calibration (payload: reference target)
    Calibrate = 0x20,

    // Scan execution
    StartScan = 0x30,
    ReadData = 0x31,
    StopScan = 0x32,

    // Recovery
    Reset = 0x3F,
}

impl Command {
    /// Commands that move the carriage or produce image data
    pub fn is_scan_control(self) -> bool {
        matches!(self, Self::StartScan | Self::ReadData | Self::StopScan)
    }

    /// Commands that change device-side configuration
    pub fn is_register_write(self) -> bool {
        matches!(self, Self::WriteRegister | Self::WriteRegisterWord)
    }

    /// Get command name
    pub fn name(self) -> &'static str {
        match self {
            Self::Identify => "CMD_IDENTIFY",
            Self::ReadRegister => "CMD_READ_REG",
            Self::WriteRegister => "CMD_WRITE_REG",
            Self::ReadRegisterWord => "CMD_READ_REG16",
            Self::WriteRegisterWord => "CMD_WRITE_REG16",
            Self::Calibrate => "CMD_CALIBRATE",
            Self::StartScan => "CMD_START_SCAN",
            Self::ReadData => "CMD_READ_DATA",
            Self::StopScan => "CMD_STOP_SCAN",
            Self::Reset => "CMD_RESET",
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        cmd as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Identify),
            0x10 => Ok(Self::ReadRegister),
            0x11 => Ok(Self::WriteRegister),
            0x12 => Ok(Self::ReadRegisterWord),
            0x13 => Ok(Self::WriteRegisterWord),
            0x20 => Ok(Self::Calibrate),
            0x30 => Ok(Self::StartScan),
            0x31 => Ok(Self::ReadData),
            0x32 => Ok(Self::StopScan),
            0x3F => Ok(Self::Reset),
            _ => Err(Error::UnknownCommand(value)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), *self as u8)
    }
}

/// Response status codes
///
/// First byte of every response frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    /// No more image data; scan finished on the device side
    EndOfData = 0x01,
    Busy = 0x02,
    NotReady = 0x03,
    InvalidArgument = 0x04,
    Unsupported = 0x05,
    DeviceError = 0x06,
}

impl Status {
    /// Check if this is a success response
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::EndOfData)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "STATUS_OK",
            Self::EndOfData => "STATUS_EOD",
            Self::Busy => "STATUS_BUSY",
            Self::NotReady => "STATUS_NOT_READY",
            Self::InvalidArgument => "STATUS_INVALID",
            Self::Unsupported => "STATUS_UNSUPPORTED",
            Self::DeviceError => "STATUS_ERROR",
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::EndOfData),
            0x02 => Ok(Self::Busy),
            0x03 => Ok(Self::NotReady),
            0x04 => Ok(Self::InvalidArgument),
            0x05 => Ok(Self::Unsupported),
            0x06 => Ok(Self::DeviceError),
            _ => Err(Error::UnknownStatus(value)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:02X})", self.name(), *self as u8)
    }
}
