//! Frame codec for the BMS register protocol.
//!
//! Every frame on the wire is `7F 55 SRC TARGET FUNC <payload> CRC_LO CRC_HI
//! FD`. The CRC-16/MODBUS trailer covers the bytes from the target address
//! through the last payload byte; the two head bytes and the source address
//! are outside the checksummed region.

use crate::crc::crc16;
use serde::Serialize;

pub const FRAME_HEAD_0: u8 = 0x7F;
pub const FRAME_HEAD_1: u8 = 0x55;
pub const FRAME_TAIL: u8 = 0xFD;

/// Default source address of the host side.
pub const HOST_ADDRESS: u8 = 0xFE;

pub const FUNC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FUNC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
pub const FUNC_ASSIGN_SLAVE_ADDRESS: u8 = 0x11;
/// Extended read used to fetch the controller board UUID.
pub const FUNC_READ_UUID: u8 = 0xFF;

/// Hard per-frame register limit of the protocol (1..=120 registers).
pub const MAX_REGISTERS_PER_FRAME: usize = 0x78;

const MIN_FRAME_LEN: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too short ({0} bytes)")]
    FrameTooShort(usize),
    #[error("bad frame header")]
    BadHeader,
    #[error("bad frame tail")]
    BadTail,
    #[error("CRC mismatch (declared {declared:#06x}, calculated {calculated:#06x})")]
    CrcMismatch { declared: u16, calculated: u16 },
    #[error("read response length mismatch (byte count {byte_count}, frame length {length})")]
    LengthMismatch { byte_count: u8, length: usize },
    #[error("unknown frame type (function {function:#04x}, length {length})")]
    UnknownFrameType { function: u8, length: usize },
    #[error("register quantity out of range: {0}")]
    QuantityOutOfRange(u16),
    #[error("too many registers for one frame: {0} (max 120)")]
    TooManyRegisters(usize),
    #[error("register data length must be even, got {0}")]
    OddByteCount(usize),
    #[error("register address out of range: {address:#06x}")]
    AddressOutOfRange { address: u16 },
    #[error("byte span out of range: {address:#06x} len={len}")]
    SpanOutOfRange { address: u16, len: usize },
    #[error("invalid MAC address")]
    InvalidMac,
    #[error("invalid hex payload")]
    InvalidHex,
    /// The device answered with an error frame.
    #[error("device error response (function {function:#04x}, code {code:#04x})")]
    ErrorResponse {
        src: u8,
        target: u8,
        function: u8,
        code: u8,
    },
    /// The response parsed fine but is not the kind the request calls for.
    #[error("unexpected response type (expected {expected})")]
    UnexpectedResponse { expected: &'static str },
}

/// A validated response frame, discriminated by length and function code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ParsedFrame {
    /// Error reply: request function code with the high bit set, one code byte.
    Error {
        source: u8,
        target: u8,
        function: u8,
        code: u8,
    },
    /// Register read reply (functions 0x03 and 0xFF share this shape).
    Read {
        source: u8,
        target: u8,
        function: u8,
        data: Vec<u8>,
    },
    /// Write acknowledgement echoing the start address and register count.
    Write {
        source: u8,
        target: u8,
        function: u8,
        start_address: u16,
        quantity: u16,
    },
}

impl ParsedFrame {
    pub fn source(&self) -> u8 {
        match *self {
            ParsedFrame::Error { source, .. }
            | ParsedFrame::Read { source, .. }
            | ParsedFrame::Write { source, .. } => source,
        }
    }

    pub fn target(&self) -> u8 {
        match *self {
            ParsedFrame::Error { target, .. }
            | ParsedFrame::Read { target, .. }
            | ParsedFrame::Write { target, .. } => target,
        }
    }

    pub fn function(&self) -> u8 {
        match *self {
            ParsedFrame::Error { function, .. }
            | ParsedFrame::Read { function, .. }
            | ParsedFrame::Write { function, .. } => function,
        }
    }
}

fn push_u16_be(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// CRC over the region from the target address through the last payload byte.
/// `body` is the frame without CRC and tail.
fn frame_crc(body: &[u8]) -> u16 {
    crc16(&body[3..])
}

fn finish_frame(mut bytes: Vec<u8>) -> Vec<u8> {
    let crc = frame_crc(&bytes);
    bytes.push((crc & 0xFF) as u8);
    bytes.push((crc >> 8) as u8);
    bytes.push(FRAME_TAIL);
    bytes
}

/// Builds a register read request (also used for the UUID read with
/// [`FUNC_READ_UUID`]).
pub fn build_read_frame(
    source: u8,
    target: u8,
    function: u8,
    start_address: u16,
    quantity: u16,
) -> Result<Vec<u8>, ProtocolError> {
    if quantity < 1 {
        return Err(ProtocolError::QuantityOutOfRange(quantity));
    }
    let mut bytes = vec![FRAME_HEAD_0, FRAME_HEAD_1, source, target, function];
    push_u16_be(&mut bytes, start_address);
    push_u16_be(&mut bytes, quantity);
    Ok(finish_frame(bytes))
}

/// Builds a write-multiple-registers request.
pub fn build_write_frame(
    source: u8,
    target: u8,
    function: u8,
    start_address: u16,
    registers: &[u16],
) -> Result<Vec<u8>, ProtocolError> {
    if registers.is_empty() {
        return Err(ProtocolError::QuantityOutOfRange(0));
    }
    if registers.len() > MAX_REGISTERS_PER_FRAME {
        return Err(ProtocolError::TooManyRegisters(registers.len()));
    }
    let quantity = registers.len() as u16;
    let mut bytes = vec![FRAME_HEAD_0, FRAME_HEAD_1, source, target, function];
    push_u16_be(&mut bytes, start_address);
    push_u16_be(&mut bytes, quantity);
    bytes.push((quantity * 2) as u8);
    for register in registers {
        push_u16_be(&mut bytes, *register);
    }
    Ok(finish_frame(bytes))
}

/// Parses and validates one complete frame.
///
/// Validation order: length, header, tail, CRC, then shape dispatch on
/// (length, function code). Anything that does not match one of the three
/// known shapes is rejected.
pub fn parse_frame(bytes: &[u8]) -> Result<ParsedFrame, ProtocolError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(ProtocolError::FrameTooShort(bytes.len()));
    }
    if bytes[0] != FRAME_HEAD_0 || bytes[1] != FRAME_HEAD_1 {
        return Err(ProtocolError::BadHeader);
    }
    if bytes[bytes.len() - 1] != FRAME_TAIL {
        return Err(ProtocolError::BadTail);
    }

    let declared = u16::from(bytes[bytes.len() - 3]) | (u16::from(bytes[bytes.len() - 2]) << 8);
    let body = &bytes[..bytes.len() - 3];
    let calculated = frame_crc(body);
    if declared != calculated {
        log::warn!("CRC mismatch - declared={declared:#06x} calculated={calculated:#06x}");
        return Err(ProtocolError::CrcMismatch {
            declared,
            calculated,
        });
    }

    let source = bytes[2];
    let target = bytes[3];
    let function = bytes[4];

    // Error reply: the request function code with the high bit set, one
    // error-code byte.
    if bytes.len() == 9 && function & 0x80 != 0 {
        return Ok(ParsedFrame::Error {
            source,
            target,
            function,
            code: bytes[5],
        });
    }

    if bytes.len() >= 10
        && (function == FUNC_READ_HOLDING_REGISTERS || function == FUNC_READ_UUID)
    {
        let byte_count = bytes[5];
        // head(2) + src/target/func(3) + count(1) + data + crc(2) + tail(1)
        let expected = 9 + usize::from(byte_count);
        if bytes.len() != expected {
            return Err(ProtocolError::LengthMismatch {
                byte_count,
                length: bytes.len(),
            });
        }
        return Ok(ParsedFrame::Read {
            source,
            target,
            function,
            data: bytes[6..6 + usize::from(byte_count)].to_vec(),
        });
    }

    if bytes.len() == 12
        && (function == FUNC_WRITE_MULTIPLE_REGISTERS || function == FUNC_ASSIGN_SLAVE_ADDRESS)
    {
        let start_address = u16::from_be_bytes([bytes[5], bytes[6]]);
        let quantity = u16::from_be_bytes([bytes[7], bytes[8]]);
        return Ok(ParsedFrame::Write {
            source,
            target,
            function,
            start_address,
            quantity,
        });
    }

    Err(ProtocolError::UnknownFrameType {
        function,
        length: bytes.len(),
    })
}

/// Splits big-endian payload bytes into register words. The length must be
/// even; read replies always carry whole registers.
pub fn split_registers_be(data: &[u8]) -> Result<Vec<u16>, ProtocolError> {
    if data.len() % 2 != 0 {
        return Err(ProtocolError::OddByteCount(data.len()));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Serializes register words into big-endian payload bytes.
pub fn join_registers_be(registers: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(registers.len() * 2);
    for register in registers {
        out.extend_from_slice(&register.to_be_bytes());
    }
    out
}
