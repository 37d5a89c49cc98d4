//! Record Access Control Point encode/decode.
//!
//! Requests are `[op][operator][operand...]`; the peripheral answers over the
//! same indication channel with either a number-of-records response or a
//! response-code message naming the request it answers.

use nom::number::complete::{le_u16, u8};
use nom::IResult;

use crate::error::ProtocolError;
use crate::wire::{append_crc, verify_crc};

const CONTEXT: &str = "racp";

const OPERATOR_NULL: u8 = 0x00;
const OPERATOR_ALL_RECORDS: u8 = 0x01;
const OPERATOR_GREATER_OR_EQUAL: u8 = 0x03;
const OPERATOR_FIRST: u8 = 0x05;
const OPERATOR_LAST: u8 = 0x06;

/// Filter type operand for sequence-number comparisons.
const FILTER_SEQUENCE_NUMBER: u8 = 0x01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    ReportStoredRecords,
    AbortOperation,
    ReportNumberOfStoredRecords,
    NumberOfStoredRecordsResponse,
    ResponseCode,
}

impl OpCode {
    pub fn to_u8(self) -> u8 {
        match self {
            OpCode::ReportStoredRecords => 0x01,
            OpCode::AbortOperation => 0x03,
            OpCode::ReportNumberOfStoredRecords => 0x04,
            OpCode::NumberOfStoredRecordsResponse => 0x05,
            OpCode::ResponseCode => 0x06,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(OpCode::ReportStoredRecords),
            0x03 => Some(OpCode::AbortOperation),
            0x04 => Some(OpCode::ReportNumberOfStoredRecords),
            0x05 => Some(OpCode::NumberOfStoredRecordsResponse),
            0x06 => Some(OpCode::ResponseCode),
            _ => None,
        }
    }
}

/// Which records a report/count request addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RacpFilter {
    AllRecords,
    GreaterOrEqual(u16),
    First,
    Last,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    OpCodeNotSupported,
    InvalidOperator,
    OperatorNotSupported,
    InvalidOperand,
    NoRecordsFound,
    AbortUnsuccessful,
    ProcedureNotCompleted,
    OperandNotSupported,
}

impl ResponseCode {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x01 => Some(ResponseCode::Success),
            0x02 => Some(ResponseCode::OpCodeNotSupported),
            0x03 => Some(ResponseCode::InvalidOperator),
            0x04 => Some(ResponseCode::OperatorNotSupported),
            0x05 => Some(ResponseCode::InvalidOperand),
            0x06 => Some(ResponseCode::NoRecordsFound),
            0x07 => Some(ResponseCode::AbortUnsuccessful),
            0x08 => Some(ResponseCode::ProcedureNotCompleted),
            0x09 => Some(ResponseCode::OperandNotSupported),
            _ => None,
        }
    }
}

/// A parsed RACP indication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RacpResponse {
    /// Count-only answer to a number-of-records request. Records matching the
    /// filter will be (or were) delivered separately on the measurement
    /// channel.
    NumberOfRecords(u16),
    /// Completion message for the named request.
    ResponseCode {
        request: OpCode,
        code: ResponseCode,
    },
}

fn encode(op: OpCode, filter: RacpFilter, e2e: bool) -> Vec<u8> {
    let mut out = vec![op.to_u8()];
    match filter {
        RacpFilter::AllRecords => out.push(OPERATOR_ALL_RECORDS),
        RacpFilter::GreaterOrEqual(seq) => {
            out.push(OPERATOR_GREATER_OR_EQUAL);
            out.push(FILTER_SEQUENCE_NUMBER);
            out.extend_from_slice(&seq.to_le_bytes());
        }
        RacpFilter::First => out.push(OPERATOR_FIRST),
        RacpFilter::Last => out.push(OPERATOR_LAST),
    }
    if e2e {
        append_crc(&mut out);
    }
    out
}

/// Request delivery of the records matching `filter`.
pub fn report_stored_records(filter: RacpFilter, e2e: bool) -> Vec<u8> {
    encode(OpCode::ReportStoredRecords, filter, e2e)
}

/// Request only the count of records matching `filter`.
pub fn report_number_of_stored_records(filter: RacpFilter, e2e: bool) -> Vec<u8> {
    encode(OpCode::ReportNumberOfStoredRecords, filter, e2e)
}

/// Abort the operation currently in progress on the peripheral.
pub fn abort_operation(e2e: bool) -> Vec<u8> {
    let mut out = vec![OpCode::AbortOperation.to_u8(), OPERATOR_NULL];
    if e2e {
        append_crc(&mut out);
    }
    out
}

fn malformed(reason: String) -> ProtocolError {
    ProtocolError::MalformedPayload {
        context: CONTEXT,
        reason,
    }
}

fn response_fields(input: &[u8]) -> IResult<&[u8], (u8, u8)> {
    let (input, op) = u8(input)?;
    let (input, operator) = u8(input)?;
    Ok((input, (op, operator)))
}

/// Parse one RACP indication payload.
pub fn decode_response(payload: &[u8], e2e: bool) -> Result<RacpResponse, ProtocolError> {
    let body = if e2e {
        verify_crc(payload, CONTEXT)?
    } else {
        payload
    };

    let (rest, (op, _operator)) =
        response_fields(body).map_err(|_| malformed("response shorter than two octets".to_string()))?;

    match OpCode::from_u8(op) {
        Some(OpCode::NumberOfStoredRecordsResponse) => {
            let (_, count) = le_u16::<_, nom::error::Error<&[u8]>>(rest)
                .map_err(|_| malformed("number-of-records response missing count".to_string()))?;
            Ok(RacpResponse::NumberOfRecords(count))
        }
        Some(OpCode::ResponseCode) => {
            if rest.len() < 2 {
                return Err(malformed("response code message missing operands".to_string()));
            }
            let request = OpCode::from_u8(rest[0])
                .ok_or_else(|| malformed(format!("unknown request op code 0x{:02x}", rest[0])))?;
            let code = ResponseCode::from_u8(rest[1])
                .ok_or_else(|| malformed(format!("unknown response code 0x{:02x}", rest[1])))?;
            Ok(RacpResponse::ResponseCode { request, code })
        }
        _ => Err(ProtocolError::UnexpectedResponse { opcode: op }),
    }
}
