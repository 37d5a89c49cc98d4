use uuid::Uuid;

use thiserror::Error;

/// Failures reported by the transport adapter. These are the only errors that
/// may end a session; the engine never retries them itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("required channel {0} is not exposed by the peripheral")]
    ServiceUnsupported(Uuid),

    #[error("not connected to a peripheral")]
    NotConnected,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("write to channel {channel} rejected: {reason}")]
    WriteRejected { channel: Uuid, reason: String },

    #[error("read from channel {channel} rejected: {reason}")]
    ReadRejected { channel: Uuid, reason: String },

    #[error("no response from peripheral within the configured timeout")]
    Timeout,
}

/// Data-level failures while decoding a single payload or response. These
/// never tear down the connection; the affected item is logged and dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed {context} payload: {reason}")]
    MalformedPayload {
        context: &'static str,
        reason: String,
    },

    #[error("unexpected response op code 0x{opcode:02x}")]
    UnexpectedResponse { opcode: u8 },

    #[error("e2e crc mismatch: transmitted 0x{transmitted:04x}, computed 0x{computed:04x}")]
    CrcMismatch { transmitted: u16, computed: u16 },
}

/// Usage and lifecycle errors returned synchronously from the session handle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("a retrieval operation is already in progress")]
    OperationInProgress,

    #[error("session clock is not established")]
    ClockNotEstablished,

    #[error("the active profile has no session control channel")]
    SessionControlUnavailable,

    #[error("session engine is closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}
