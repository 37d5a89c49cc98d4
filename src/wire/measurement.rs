//! CGM measurement notification decoding.
//!
//! Each notification carries one or more variable-length records, each
//! prefixed by its own size octet:
//!
//! ```text
//! [size][flags][concentration sfloat16][time_offset u16]
//!       [status octet?][cal/temp octet?][warning octet?]
//!       [trend sfloat16?][quality sfloat16?][e2e-crc u16?]
//! ```
//!
//! Optional fields are governed by the flags octet; the size octet covers the
//! whole record including the CRC when the peripheral's feature set declares
//! E2E safety.

use nom::number::complete::{le_u16, u8};
use nom::IResult;

use crate::error::ProtocolError;
use crate::wire::{sfloat_to_f32, verify_crc};

const FLAG_TREND_PRESENT: u8 = 0x01;
const FLAG_QUALITY_PRESENT: u8 = 0x02;
const FLAG_WARNING_OCTET: u8 = 0x20;
const FLAG_CAL_TEMP_OCTET: u8 = 0x40;
const FLAG_STATUS_OCTET: u8 = 0x80;

const CONTEXT: &str = "cgm measurement";

/// One decoded measurement record, still relative to the session clock.
#[derive(Clone, Debug, PartialEq)]
pub struct RawMeasurement {
    /// Minutes since session start; doubles as the record's sequence number.
    pub time_offset: u16,
    pub concentration_mg_dl: f32,
    pub trend_mg_dl_min: Option<f32>,
    pub quality_percent: Option<f32>,
    /// Sensor status annunciation octets, assembled as
    /// `warning << 16 | cal_temp << 8 | status`.
    pub annunciation: Option<u32>,
}

struct RawFields {
    flags: u8,
    concentration: u16,
    time_offset: u16,
    status: Option<u8>,
    cal_temp: Option<u8>,
    warning: Option<u8>,
    trend: Option<u16>,
    quality: Option<u16>,
}

fn optional_u8(input: &[u8], present: bool) -> IResult<&[u8], Option<u8>> {
    if present {
        let (rest, value) = u8(input)?;
        Ok((rest, Some(value)))
    } else {
        Ok((input, None))
    }
}

fn optional_le_u16(input: &[u8], present: bool) -> IResult<&[u8], Option<u16>> {
    if present {
        let (rest, value) = le_u16(input)?;
        Ok((rest, Some(value)))
    } else {
        Ok((input, None))
    }
}

fn record_fields(input: &[u8]) -> IResult<&[u8], RawFields> {
    let (input, flags) = u8(input)?;
    let (input, concentration) = le_u16(input)?;
    let (input, time_offset) = le_u16(input)?;
    let (input, status) = optional_u8(input, flags & FLAG_STATUS_OCTET != 0)?;
    let (input, cal_temp) = optional_u8(input, flags & FLAG_CAL_TEMP_OCTET != 0)?;
    let (input, warning) = optional_u8(input, flags & FLAG_WARNING_OCTET != 0)?;
    let (input, trend) = optional_le_u16(input, flags & FLAG_TREND_PRESENT != 0)?;
    let (input, quality) = optional_le_u16(input, flags & FLAG_QUALITY_PRESENT != 0)?;
    Ok((
        input,
        RawFields {
            flags,
            concentration,
            time_offset,
            status,
            cal_temp,
            warning,
            trend,
            quality,
        },
    ))
}

fn malformed(reason: String) -> ProtocolError {
    ProtocolError::MalformedPayload {
        context: CONTEXT,
        reason,
    }
}

/// Decode every record carried by one notification payload.
///
/// A single notification may carry multiple size-prefixed records; the whole
/// payload must be consumed exactly by the framing.
pub fn decode_measurements(
    payload: &[u8],
    e2e: bool,
) -> Result<Vec<RawMeasurement>, ProtocolError> {
    if payload.is_empty() {
        return Err(malformed("empty notification".to_string()));
    }

    let mut out = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let size = rest[0] as usize;
        let min = if e2e { 8 } else { 6 };
        if size < min {
            return Err(malformed(format!("record size {size} below minimum {min}")));
        }
        if size > rest.len() {
            return Err(malformed(format!(
                "record size {size} exceeds remaining {} bytes",
                rest.len()
            )));
        }
        out.push(decode_one(&rest[..size], e2e)?);
        rest = &rest[size..];
    }
    Ok(out)
}

fn decode_one(record: &[u8], e2e: bool) -> Result<RawMeasurement, ProtocolError> {
    // The CRC covers the record from its size octet onward.
    let body = if e2e {
        verify_crc(record, CONTEXT)?
    } else {
        record
    };

    let (_, fields) = record_fields(&body[1..])
        .map_err(|_| malformed("record truncated mid-field".to_string()))?;

    let concentration = sfloat_to_f32(fields.concentration)
        .ok_or_else(|| malformed("concentration is not a finite value".to_string()))?;

    let annunciation = if fields.flags & (FLAG_STATUS_OCTET | FLAG_CAL_TEMP_OCTET | FLAG_WARNING_OCTET) != 0 {
        Some(
            u32::from(fields.status.unwrap_or(0))
                | u32::from(fields.cal_temp.unwrap_or(0)) << 8
                | u32::from(fields.warning.unwrap_or(0)) << 16,
        )
    } else {
        None
    };

    Ok(RawMeasurement {
        time_offset: fields.time_offset,
        concentration_mg_dl: concentration,
        trend_mg_dl_min: fields.trend.and_then(sfloat_to_f32),
        quality_percent: fields.quality.and_then(sfloat_to_f32),
        annunciation,
    })
}
