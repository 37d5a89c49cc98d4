use serde::{Deserialize, Serialize};

/// One retrieved or streamed measurement, keyed by its peripheral-assigned
/// sequence number. A later decode with the same sequence number replaces the
/// earlier one; peripheral resends are authoritative overwrites.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub sequence_number: u16,
    /// Glucose concentration in mg/dL.
    pub concentration_mg_dl: f32,
    /// Rate of change in (mg/dL)/min, when the peripheral includes it.
    pub trend_mg_dl_min: Option<f32>,
    /// Measurement quality in percent, when the peripheral includes it.
    pub quality_percent: Option<f32>,
    /// Minutes since session start, as carried on the wire.
    pub offset_minutes: i32,
    /// Absolute time reconstructed from the session clock.
    pub timestamp_unix: i64,
}

/// The kind of page requested from the peripheral's record store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetrievalRequest {
    All,
    First,
    Last,
    GreaterOrEqual(u16),
}

/// Externally visible outcome of the most recent retrieval operation.
/// At most one retrieval is `Pending` at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Idle,
    Pending,
    Success,
    Aborted,
    NotSupported,
    Failed,
}

/// Immutable state published after every engine mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Retrieved records ordered by sequence number.
    pub records: Vec<Record>,
    pub battery_percent: Option<u8>,
    pub request_status: RequestStatus,
}

impl SessionSnapshot {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            battery_percent: None,
            request_status: RequestStatus::Idle,
        }
    }
}

/// Connection-state changes delivered by the transport adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Disconnected(String),
    ServicesInvalidated,
}
