//! Wire codec for the five RFC 1350 packet kinds.
//!
//! Layouts (all integers network byte order):
//!
//! ```text
//! RRQ/WRQ:  | 0x00 | 0x01/0x02 | filename | 0x00 | mode | 0x00 |
//! DATA:     | 0x00 | 0x03 | block (u16) | payload (0..=512 bytes) |
//! ACK:      | 0x00 | 0x04 | block (u16) |
//! ERROR:    | 0x00 | 0x05 | code (u16) | message | 0x00 |
//! ```
//!
//! A DATA payload shorter than [`BLOCK_SIZE`] marks the final block of a
//! transfer. Decoding fails closed: any field that would read past the end of
//! the datagram, or past its fixed capacity, rejects the whole packet.

use std::error;
use std::fmt;
use std::str;

/// Maximum DATA payload per block.
pub const BLOCK_SIZE: usize = 512;

/// Capacity of the filename and error-message fields.
pub const MAX_TEXT: usize = 512;

/// Capacity of the mode field ("netascii" is the longest mode we ever see).
pub const MAX_MODE: usize = 12;

/// Largest encoded packet: DATA header plus a full block.
pub const MAX_PACKET: usize = 4 + BLOCK_SIZE;

/// The only transfer mode this implementation speaks.
pub const MODE_OCTET: &str = "octet";

const OP_RRQ: u8 = 1;
const OP_WRQ: u8 = 2;
const OP_DATA: u8 = 3;
const OP_ACK: u8 = 4;
const OP_ERROR: u8 = 5;

/// A datagram that could not be decoded. Never fatal to a session: the
/// dispatcher drops the datagram and keeps listening.
#[derive(Debug, PartialEq)]
pub struct MalformedPacket(pub String);

impl error::Error for MalformedPacket {}

impl fmt::Display for MalformedPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "malformed packet: {}", self.0)
    }
}

/// TFTP error codes carried in ERROR packets.
///
/// The original program only ever emits `NotDefined` and `FileNotFound`
/// (the latter for any file-open failure); the rest exist so that peer
/// errors decode to something printable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTid,
    FileExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::NotDefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// Unknown codes collapse to `NotDefined` rather than rejecting the
    /// packet; the peer is already telling us the session is over.
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// One fully decoded protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    ReadReq { filename: String, mode: String },
    WriteReq { filename: String, mode: String },
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
}

impl Packet {
    /// True for a DATA packet that definitionally ends its transfer.
    pub fn is_final_data(&self) -> bool {
        matches!(self, Packet::Data { payload, .. } if payload.len() < BLOCK_SIZE)
    }

    /// Short tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::ReadReq { .. } => "RRQ",
            Packet::WriteReq { .. } => "WRQ",
            Packet::Data { .. } => "DATA",
            Packet::Ack { .. } => "ACK",
            Packet::Error { .. } => "ERROR",
        }
    }
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Reads a NUL-terminated string of at most `cap` bytes starting at the
/// beginning of `buf`. Returns the string and the number of bytes consumed
/// including the terminator. Fails if the terminator is missing from the
/// buffer or would sit past `cap`.
fn read_cstr(buf: &[u8], cap: usize) -> Result<(String, usize), MalformedPacket> {
    let limit = cap.min(buf.len());
    match buf[..limit].iter().position(|&b| b == 0) {
        Some(end) => {
            let s = str::from_utf8(&buf[..end])
                .map_err(|_| MalformedPacket("string field is not valid UTF-8".to_string()))?;
            Ok((s.to_string(), end + 1))
        }
        None => Err(MalformedPacket(format!(
            "string field missing NUL terminator within {limit} bytes"
        ))),
    }
}

fn decode_request(buf: &[u8]) -> Result<(String, String), MalformedPacket> {
    let (filename, used) = read_cstr(buf, MAX_TEXT)?;
    if filename.is_empty() {
        return Err(MalformedPacket("empty filename in request".to_string()));
    }
    let (mode, _) = read_cstr(&buf[used..], MAX_MODE)?;
    Ok((filename, mode))
}

/// Decodes one received datagram into a [`Packet`].
pub fn decode(buf: &[u8]) -> Result<Packet, MalformedPacket> {
    if buf.len() < 4 {
        return Err(MalformedPacket(format!("datagram too short: {} bytes", buf.len())));
    }
    if buf[0] != 0 {
        return Err(MalformedPacket(format!("bad opcode high byte: {:#04x}", buf[0])));
    }

    match buf[1] {
        OP_RRQ => {
            let (filename, mode) = decode_request(&buf[2..])?;
            Ok(Packet::ReadReq { filename, mode })
        }
        OP_WRQ => {
            let (filename, mode) = decode_request(&buf[2..])?;
            Ok(Packet::WriteReq { filename, mode })
        }
        OP_DATA => {
            let payload = &buf[4..];
            if payload.len() > BLOCK_SIZE {
                return Err(MalformedPacket(format!(
                    "DATA payload of {} bytes exceeds block size",
                    payload.len()
                )));
            }
            Ok(Packet::Data { block: read_u16(&buf[2..4]), payload: payload.to_vec() })
        }
        OP_ACK => Ok(Packet::Ack { block: read_u16(&buf[2..4]) }),
        OP_ERROR => {
            let (message, _) = read_cstr(&buf[4..], MAX_TEXT)?;
            Ok(Packet::Error { code: ErrorCode::from_u16(read_u16(&buf[2..4])), message })
        }
        op => Err(MalformedPacket(format!("unknown opcode: {op}"))),
    }
}

/// Appends a NUL-terminated string of at most `cap` bytes including the
/// terminator. Over-capacity strings are refused, not truncated; the encode
/// side fails closed just like the decode side.
fn push_cstr(out: &mut Vec<u8>, s: &str, cap: usize) -> Result<(), MalformedPacket> {
    let bytes = s.as_bytes();
    if bytes.len() > cap - 1 {
        return Err(MalformedPacket(format!(
            "string field of {} bytes exceeds capacity of {}",
            bytes.len(),
            cap - 1
        )));
    }
    out.extend_from_slice(bytes);
    out.push(0);
    Ok(())
}

/// Encodes a packet into the exact bytes to hand to the transport.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, MalformedPacket> {
    let mut out = Vec::with_capacity(MAX_PACKET);
    out.push(0);
    match packet {
        Packet::ReadReq { filename, mode } | Packet::WriteReq { filename, mode } => {
            out.push(if matches!(packet, Packet::ReadReq { .. }) { OP_RRQ } else { OP_WRQ });
            push_cstr(&mut out, filename, MAX_TEXT)?;
            push_cstr(&mut out, mode, MAX_MODE)?;
        }
        Packet::Data { block, payload } => {
            if payload.len() > BLOCK_SIZE {
                return Err(MalformedPacket(format!(
                    "DATA payload of {} bytes exceeds block size",
                    payload.len()
                )));
            }
            out.push(OP_DATA);
            out.extend_from_slice(&block.to_be_bytes());
            out.extend_from_slice(payload);
        }
        Packet::Ack { block } => {
            out.push(OP_ACK);
            out.extend_from_slice(&block.to_be_bytes());
        }
        Packet::Error { code, message } => {
            out.push(OP_ERROR);
            out.extend_from_slice(&code.as_u16().to_be_bytes());
            push_cstr(&mut out, message, MAX_TEXT)?;
        }
    }
    Ok(out)
}
