//! Session clock reconstruction.
//!
//! The wire format carries only a relative minute-offset per record; absolute
//! time is a local reconstruction that must stay stable for the lifetime of
//! one sensor session so historical and live records remain comparable.

use crate::error::SessionError;

/// Derives absolute timestamps from the relative minute-offsets carried by
/// measurements. Established once per session, cleared on session stop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionClock {
    start_unix: Option<i64>,
}

impl SessionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_established(&self) -> bool {
        self.start_unix.is_some()
    }

    pub fn start_unix(&self) -> Option<i64> {
        self.start_unix
    }

    /// Anchor the clock from a measurement observed `offset_minutes` into the
    /// session. First-seen wins; later offsets never move an established clock.
    pub fn establish(&mut self, offset_minutes: i32, now_unix: i64) {
        if self.start_unix.is_none() {
            self.start_unix = Some(now_unix - i64::from(offset_minutes) * 60);
        }
    }

    /// A new session was started on the peripheral at `now_unix`.
    pub fn on_session_started(&mut self, now_unix: i64) {
        self.start_unix = Some(now_unix);
    }

    /// The peripheral acknowledged a session stop; the next session must
    /// re-establish the clock before offsets can be resolved.
    pub fn on_session_stopped(&mut self) {
        self.start_unix = None;
    }

    /// Absolute time of a record `offset_minutes` into the session.
    pub fn resolve(&self, offset_minutes: i32) -> Result<i64, SessionError> {
        let start = self.start_unix.ok_or(SessionError::ClockNotEstablished)?;
        Ok(start + i64::from(offset_minutes) * 60)
    }
}
