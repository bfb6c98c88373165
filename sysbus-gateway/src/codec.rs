//! SysBus frame codec.
//!
//! SysBus is Modbus RTU with a restricted function set. Every frame is
//! `slave | function | body | crc16`, with the CRC (Modbus polynomial)
//! transmitted low byte first and every register word big-endian.
//!
//! The codec is pure: the master half (`encode_request`, `decode_response`)
//! is used by the bus scheduler, the device half (`decode_request`,
//! `encode_response`, `encode_exception`) by the simulated controller.

use crc::{CRC_16_MODBUS, Crc};

use crate::config::Space;
use crate::error::DecodeError;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Maximum registers in one read request.
pub const MAX_READ_COUNT: u16 = 125;

/// Maximum registers in one write-multiple request.
pub const MAX_WRITE_COUNT: u16 = 123;

/// Exception code: function not supported.
pub const ILLEGAL_FUNCTION: u8 = 0x01;

/// Exception code: address outside the device's register map.
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Length of an exception response.
pub const EXCEPTION_LEN: usize = 5;

/// Function codes spoken on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadHolding,
    ReadInput,
    WriteSingle,
    WriteMultiple,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHolding => 0x03,
            FunctionCode::ReadInput => 0x04,
            FunctionCode::WriteSingle => 0x06,
            FunctionCode::WriteMultiple => 0x10,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            0x03 => Ok(FunctionCode::ReadHolding),
            0x04 => Ok(FunctionCode::ReadInput),
            0x06 => Ok(FunctionCode::WriteSingle),
            0x10 => Ok(FunctionCode::WriteMultiple),
            other => Err(DecodeError::UnsupportedFunction(other)),
        }
    }

    /// Read function for an address space.
    pub fn read(space: Space) -> Self {
        match space {
            Space::Input => FunctionCode::ReadInput,
            Space::Holding => FunctionCode::ReadHolding,
        }
    }

    pub fn is_read(self) -> bool {
        matches!(self, FunctionCode::ReadHolding | FunctionCode::ReadInput)
    }

    /// Address space the function operates on.
    pub fn space(self) -> Space {
        match self {
            FunctionCode::ReadInput => Space::Input,
            _ => Space::Holding,
        }
    }
}

/// One SysBus frame.
///
/// Requests and responses share this shape: for reads `payload` is empty in
/// the request and holds the register values in the response; for writes it
/// holds the values written in both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub slave: u8,
    pub function: FunctionCode,
    pub start: u16,
    pub count: u16,
    pub payload: Vec<u16>,
}

impl Frame {
    /// Read `count` registers of `space` starting at `start`.
    pub fn read(slave: u8, space: Space, start: u16, count: u16) -> Self {
        Self {
            slave,
            function: FunctionCode::read(space),
            start,
            count,
            payload: Vec::new(),
        }
    }

    /// Write one holding register.
    pub fn write_single(slave: u8, address: u16, value: u16) -> Self {
        Self {
            slave,
            function: FunctionCode::WriteSingle,
            start: address,
            count: 1,
            payload: vec![value],
        }
    }

    /// Write consecutive holding registers starting at `start`.
    pub fn write_multiple(slave: u8, start: u16, values: Vec<u16>) -> Self {
        Self {
            slave,
            function: FunctionCode::WriteMultiple,
            start,
            count: values.len() as u16,
            payload: values,
        }
    }

    /// Check the request against protocol limits.
    pub fn validate(&self) -> Result<(), String> {
        let limit = match self.function {
            FunctionCode::ReadHolding | FunctionCode::ReadInput => MAX_READ_COUNT,
            FunctionCode::WriteSingle => 1,
            FunctionCode::WriteMultiple => MAX_WRITE_COUNT,
        };

        if self.count == 0 || self.count > limit {
            return Err(format!(
                "function 0x{:02X} count {} outside 1-{}",
                self.function.code(),
                self.count,
                limit
            ));
        }

        if u32::from(self.start) + u32::from(self.count) > 0x1_0000 {
            return Err(format!(
                "range {}+{} exceeds the address space",
                self.start, self.count
            ));
        }

        if !self.function.is_read() && self.payload.len() != usize::from(self.count) {
            return Err(format!(
                "{} value(s) for a {} register write",
                self.payload.len(),
                self.count
            ));
        }

        Ok(())
    }

    /// Length in bytes of a normal response to this request.
    pub fn response_len(&self) -> usize {
        match self.function {
            FunctionCode::ReadHolding | FunctionCode::ReadInput => 5 + 2 * usize::from(self.count),
            FunctionCode::WriteSingle | FunctionCode::WriteMultiple => 8,
        }
    }
}

/// Modbus CRC-16 of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes()); // CRC is little-endian in RTU
    frame
}

fn check_crc(bytes: &[u8], min_len: usize) -> Result<&[u8], DecodeError> {
    if bytes.len() < min_len {
        return Err(DecodeError::Corrupt(format!(
            "frame of {} byte(s) is shorter than {}",
            bytes.len(),
            min_len
        )));
    }

    let data_len = bytes.len() - 2;
    let received = u16::from_le_bytes([bytes[data_len], bytes[data_len + 1]]);
    let calculated = crc16(&bytes[..data_len]);

    if received != calculated {
        return Err(DecodeError::Corrupt(format!(
            "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
            calculated, received
        )));
    }

    Ok(&bytes[..data_len])
}

fn word(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Encode a request frame (master side).
pub fn encode_request(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + 2 * frame.payload.len());
    out.push(frame.slave);
    out.push(frame.function.code());
    out.extend_from_slice(&frame.start.to_be_bytes());

    match frame.function {
        FunctionCode::ReadHolding | FunctionCode::ReadInput => {
            out.extend_from_slice(&frame.count.to_be_bytes());
        }
        FunctionCode::WriteSingle => {
            let value = frame.payload.first().copied().unwrap_or_default();
            out.extend_from_slice(&value.to_be_bytes());
        }
        FunctionCode::WriteMultiple => {
            out.extend_from_slice(&frame.count.to_be_bytes());
            out.push((frame.payload.len() * 2) as u8);
            for value in &frame.payload {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
    }

    seal(out)
}

/// Decode the response to `request` (master side).
///
/// Checks the CRC first, then that the slave, function and register range
/// answer the outstanding request.
pub fn decode_response(bytes: &[u8], request: &Frame) -> Result<Frame, DecodeError> {
    let body = check_crc(bytes, EXCEPTION_LEN)?;

    if body[0] != request.slave {
        return Err(DecodeError::Mismatch(format!(
            "response from slave {} to a request for slave {}",
            body[0], request.slave
        )));
    }

    let expected = request.function.code();
    if body[1] == expected | 0x80 {
        return Err(DecodeError::Exception {
            function: expected,
            code: body[2],
        });
    }
    if body[1] != expected {
        return Err(DecodeError::Mismatch(format!(
            "function 0x{:02X} in response to 0x{:02X}",
            body[1], expected
        )));
    }

    if bytes.len() != request.response_len() {
        return Err(DecodeError::Corrupt(format!(
            "response of {} byte(s), expected {}",
            bytes.len(),
            request.response_len()
        )));
    }

    match request.function {
        FunctionCode::ReadHolding | FunctionCode::ReadInput => {
            let byte_count = usize::from(body[2]);
            if byte_count != 2 * usize::from(request.count) {
                return Err(DecodeError::Mismatch(format!(
                    "{} data byte(s) for {} register(s)",
                    byte_count, request.count
                )));
            }

            Ok(Frame {
                payload: words(&body[3..]),
                ..request.clone()
            })
        }
        FunctionCode::WriteSingle => {
            let address = word(body, 2);
            let value = word(body, 4);
            if address != request.start || Some(&value) != request.payload.first() {
                return Err(DecodeError::Mismatch(format!(
                    "echo of {}={} for a write of {}={:?}",
                    address,
                    value,
                    request.start,
                    request.payload.first()
                )));
            }
            Ok(request.clone())
        }
        FunctionCode::WriteMultiple => {
            let start = word(body, 2);
            let count = word(body, 4);
            if start != request.start || count != request.count {
                return Err(DecodeError::Mismatch(format!(
                    "acknowledged {}+{} for a write of {}+{}",
                    start, count, request.start, request.count
                )));
            }
            Ok(request.clone())
        }
    }
}

/// Number of bytes of the request starting with `header`, or `None` when
/// more bytes are needed to tell.
pub fn request_len(header: &[u8]) -> Option<usize> {
    let function = *header.get(1)?;
    match function {
        0x10 => header.get(6).map(|byte_count| 9 + usize::from(*byte_count)),
        _ => Some(8),
    }
}

/// Decode a request frame (device side).
pub fn decode_request(bytes: &[u8]) -> Result<Frame, DecodeError> {
    let body = check_crc(bytes, 8)?;
    let function = FunctionCode::from_code(body[1])?;
    let slave = body[0];
    let start = word(body, 2);

    let frame = match function {
        FunctionCode::ReadHolding | FunctionCode::ReadInput => {
            if body.len() != 6 {
                return Err(DecodeError::Corrupt(format!(
                    "read request of {} byte(s)",
                    bytes.len()
                )));
            }
            Frame {
                slave,
                function,
                start,
                count: word(body, 4),
                payload: Vec::new(),
            }
        }
        FunctionCode::WriteSingle => {
            if body.len() != 6 {
                return Err(DecodeError::Corrupt(format!(
                    "write request of {} byte(s)",
                    bytes.len()
                )));
            }
            Frame::write_single(slave, start, word(body, 4))
        }
        FunctionCode::WriteMultiple => {
            let count = word(body, 4);
            let byte_count = usize::from(*body.get(6).unwrap_or(&0));
            if byte_count != 2 * usize::from(count) || body.len() != 7 + byte_count {
                return Err(DecodeError::Corrupt(format!(
                    "write of {} register(s) carrying {} byte(s)",
                    count, byte_count
                )));
            }
            Frame::write_multiple(slave, start, words(&body[7..]))
        }
    };

    Ok(frame)
}

/// Encode the normal response to a request (device side). For reads,
/// `frame.payload` holds the values returned.
pub fn encode_response(frame: &Frame) -> Vec<u8> {
    let mut out = vec![frame.slave, frame.function.code()];

    match frame.function {
        FunctionCode::ReadHolding | FunctionCode::ReadInput => {
            out.push((frame.payload.len() * 2) as u8);
            for value in &frame.payload {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
        FunctionCode::WriteSingle => {
            let value = frame.payload.first().copied().unwrap_or_default();
            out.extend_from_slice(&frame.start.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
        FunctionCode::WriteMultiple => {
            out.extend_from_slice(&frame.start.to_be_bytes());
            out.extend_from_slice(&frame.count.to_be_bytes());
        }
    }

    seal(out)
}

/// Encode an exception response (device side).
pub fn encode_exception(slave: u8, function: u8, code: u8) -> Vec<u8> {
    seal(vec![slave, function | 0x80, code])
}
