//! Request/response frame encoding and decoding

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

use crate::{
    command::{Command, Status},
    error::{Error, Result},
};

/// Frame header size in bytes (code + LE u16 length)
pub const HEADER_SIZE: usize = 3;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Split a frame header into its code byte and declared payload length
///
/// # Errors
///
/// Returns [`Error::FrameTooShort`] if fewer than [`HEADER_SIZE`] bytes are
/// given.
pub fn decode_header(header: &[u8]) -> Result<(u8, usize)> {
    if header.len() < HEADER_SIZE {
        return Err(Error::FrameTooShort {
            expected: HEADER_SIZE,
            actual: header.len(),
        });
    }
    let len = u16::from_le_bytes([header[1], header[2]]) as usize;
    Ok((header[0], len))
}

fn encode_frame(code: u8, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(code);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    buf
}

fn split_frame(mut buf: BytesMut) -> Result<(u8, Bytes)> {
    let (code, declared) = decode_header(&buf)?;
    let actual = buf.len() - HEADER_SIZE;
    if declared != actual {
        return Err(Error::LengthMismatch { declared, actual });
    }
    buf.advance(HEADER_SIZE);
    Ok((code, buf.freeze()))
}

fn check_payload(payload: &Bytes) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// Host-to-device frame
///
/// # Frame Structure
///
/// ```text
/// ┌───────────┬─────────────┬─────────────┐
/// │  Command  │   Length    │   Payload   │
/// │  1 byte   │   2 bytes   │   N bytes   │
/// │           │  (LE u16)   │             │
/// └───────────┴─────────────┴─────────────┘
/// ```
///
/// # Examples
///
/// ```
/// use scanrust_core::{Command, RequestFrame};
///
/// let frame = RequestFrame::with_payload(Command::ReadRegister, vec![0x41, 0x00]).unwrap();
/// let decoded = RequestFrame::decode(frame.encode()).unwrap();
/// assert_eq!(frame, decoded);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub command: Command,
    pub payload: Bytes,
}

impl RequestFrame {
    /// Create a frame with empty payload
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: Bytes::new(),
        }
    }

    /// Create a frame with payload
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] above [`MAX_PAYLOAD_SIZE`].
    pub fn with_payload(command: Command, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        check_payload(&payload)?;
        Ok(Self { command, payload })
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let buf = encode_frame(self.command.into(), &self.payload);
        trace!(command = %self.command, bytes = %hex::encode(&buf[..buf.len().min(16)]), "Encoded request");
        buf
    }

    /// Decode a complete frame
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is shorter than the header, the
    /// declared length differs from the bytes present, or the command is
    /// unknown.
    pub fn decode(buf: BytesMut) -> Result<Self> {
        let (code, payload) = split_frame(buf)?;
        Ok(Self {
            command: Command::try_from(code)?,
            payload,
        })
    }

    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFrame")
            .field("command", &self.command)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Device-to-host frame
///
/// Same layout as [`RequestFrame`] with a status byte in place of the
/// command byte.
#[derive(Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub status: Status,
    pub payload: Bytes,
}

impl ResponseFrame {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            payload: Bytes::new(),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] above [`MAX_PAYLOAD_SIZE`].
    pub fn with_payload(status: Status, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        check_payload(&payload)?;
        Ok(Self { status, payload })
    }

    pub fn encode(&self) -> BytesMut {
        encode_frame(self.status.into(), &self.payload)
    }

    /// Decode a complete frame
    ///
    /// # Errors
    ///
    /// Same conditions as [`RequestFrame::decode`], with an unknown status
    /// byte in place of an unknown command.
    pub fn decode(buf: BytesMut) -> Result<Self> {
        let (code, payload) = split_frame(buf)?;
        Ok(Self {
            status: Status::try_from(code)?,
            payload,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl fmt::Debug for ResponseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFrame")
            .field("status", &self.status)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
