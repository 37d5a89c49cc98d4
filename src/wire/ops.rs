//! Specific Ops Control Point commands plus the one-shot status, feature,
//! and battery-level reads.

use nom::number::complete::{le_u16, le_u24, u8};
use nom::IResult;

use crate::error::ProtocolError;
use crate::wire::{append_crc, verify_crc};

pub const OP_START_SESSION: u8 = 0x1A;
pub const OP_STOP_SESSION: u8 = 0x1B;
pub const OP_RESPONSE: u8 = 0x1C;

/// Sensor status annunciation bit: the session is stopped.
const STATUS_SESSION_STOPPED: u32 = 0x0000_0001;

/// Feature bit: characteristics carry an E2E-CRC field.
const FEATURE_E2E_CRC: u32 = 0x0000_1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocpResult {
    Success,
    OpCodeNotSupported,
    InvalidOperand,
    ProcedureNotCompleted,
    ParameterOutOfRange,
}

impl SocpResult {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(SocpResult::Success),
            0x02 => Some(SocpResult::OpCodeNotSupported),
            0x03 => Some(SocpResult::InvalidOperand),
            0x04 => Some(SocpResult::ProcedureNotCompleted),
            0x05 => Some(SocpResult::ParameterOutOfRange),
            _ => None,
        }
    }
}

/// Indication answering a specific-ops command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocpResponse {
    /// The op code being answered, e.g. [`OP_START_SESSION`].
    pub request: u8,
    pub result: SocpResult,
}

/// Server-side session state reported by the status read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorStatus {
    /// Minutes since session start, as tracked by the peripheral.
    pub time_offset: u16,
    /// Sensor status annunciation, 24 bits.
    pub annunciation: u32,
}

impl SensorStatus {
    pub fn session_running(&self) -> bool {
        self.annunciation & STATUS_SESSION_STOPPED == 0
    }
}

/// Capability flags reported by the feature read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorFeatures {
    pub features: u32,
    pub sample_type: u8,
    pub sample_location: u8,
}

impl SensorFeatures {
    pub fn e2e_crc_supported(&self) -> bool {
        self.features & FEATURE_E2E_CRC != 0
    }
}

pub fn start_session(e2e: bool) -> Vec<u8> {
    let mut out = vec![OP_START_SESSION];
    if e2e {
        append_crc(&mut out);
    }
    out
}

pub fn stop_session(e2e: bool) -> Vec<u8> {
    let mut out = vec![OP_STOP_SESSION];
    if e2e {
        append_crc(&mut out);
    }
    out
}

fn malformed(context: &'static str, reason: String) -> ProtocolError {
    ProtocolError::MalformedPayload { context, reason }
}

/// Parse a specific-ops indication payload.
pub fn decode_socp_response(payload: &[u8], e2e: bool) -> Result<SocpResponse, ProtocolError> {
    const CONTEXT: &str = "specific ops";
    let body = if e2e {
        verify_crc(payload, CONTEXT)?
    } else {
        payload
    };
    if body.len() < 3 {
        return Err(malformed(CONTEXT, "response shorter than three octets".to_string()));
    }
    if body[0] != OP_RESPONSE {
        return Err(ProtocolError::UnexpectedResponse { opcode: body[0] });
    }
    let result = SocpResult::from_u8(body[2])
        .ok_or_else(|| malformed(CONTEXT, format!("unknown result code 0x{:02x}", body[2])))?;
    Ok(SocpResponse {
        request: body[1],
        result,
    })
}

fn status_fields(input: &[u8]) -> IResult<&[u8], (u16, u32)> {
    let (input, offset) = le_u16(input)?;
    let (input, annunciation) = le_u24(input)?;
    Ok((input, (offset, annunciation)))
}

/// Parse a status read: `[time_offset u16][annunciation u24]`.
pub fn decode_status(payload: &[u8], e2e: bool) -> Result<SensorStatus, ProtocolError> {
    const CONTEXT: &str = "cgm status";
    let body = if e2e {
        verify_crc(payload, CONTEXT)?
    } else {
        payload
    };
    let (_, (time_offset, annunciation)) =
        status_fields(body).map_err(|_| malformed(CONTEXT, "truncated status".to_string()))?;
    Ok(SensorStatus {
        time_offset,
        annunciation,
    })
}

fn feature_fields(input: &[u8]) -> IResult<&[u8], (u32, u8)> {
    let (input, features) = le_u24(input)?;
    let (input, type_location) = u8(input)?;
    Ok((input, (features, type_location)))
}

/// Parse a feature read: `[features u24][type:4|location:4][crc u16]`.
///
/// The CRC field is always present on this characteristic; peripherals
/// without E2E safety transmit 0xFFFF there.
pub fn decode_feature(payload: &[u8]) -> Result<SensorFeatures, ProtocolError> {
    const CONTEXT: &str = "cgm feature";
    if payload.len() < 6 {
        return Err(malformed(CONTEXT, format!("{} bytes, expected 6", payload.len())));
    }
    let crc = u16::from_le_bytes([payload[4], payload[5]]);
    let body = if crc == 0xFFFF {
        &payload[..4]
    } else {
        verify_crc(&payload[..6], CONTEXT)?
    };
    let (_, (features, type_location)) =
        feature_fields(body).map_err(|_| malformed(CONTEXT, "truncated features".to_string()))?;
    Ok(SensorFeatures {
        features,
        sample_type: type_location & 0x0F,
        sample_location: type_location >> 4,
    })
}

/// Parse a battery-level read or notification: one octet, 0-100 percent.
pub fn decode_battery_level(payload: &[u8]) -> Result<u8, ProtocolError> {
    const CONTEXT: &str = "battery level";
    match payload {
        [level] if *level <= 100 => Ok(*level),
        [level] => Err(malformed(CONTEXT, format!("{level} percent out of range"))),
        _ => Err(malformed(CONTEXT, format!("{} bytes, expected 1", payload.len()))),
    }
}
