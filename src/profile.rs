//! GATT channel tables for the sensor profiles the engine can drive.
//!
//! All assigned numbers live in the Bluetooth SIG base namespace
//! `0000XXXX-0000-1000-8000-00805f9b34fb`. A profile is static configuration,
//! not state: the generic session is parameterized by one of these
//! descriptors and never hard-codes a channel itself.

use uuid::Uuid;

/// Continuous Glucose Monitoring service.
pub const CGM_SERVICE: Uuid = Uuid::from_u128(0x0000181f_0000_1000_8000_00805f9b34fb);

/// CGM Measurement characteristic (notify). Carries one or more measurement
/// records per notification, both live and during historical delivery.
pub const CGM_MEASUREMENT: Uuid = Uuid::from_u128(0x00002aa7_0000_1000_8000_00805f9b34fb);

/// CGM Feature characteristic (read).
pub const CGM_FEATURE: Uuid = Uuid::from_u128(0x00002aa8_0000_1000_8000_00805f9b34fb);

/// CGM Status characteristic (read). Reports the server-side time offset and
/// whether a session is currently running.
pub const CGM_STATUS: Uuid = Uuid::from_u128(0x00002aa9_0000_1000_8000_00805f9b34fb);

/// Record Access Control Point (write + indicate). The command/response
/// channel for historical-record retrieval.
pub const RECORD_ACCESS_CONTROL_POINT: Uuid =
    Uuid::from_u128(0x00002a52_0000_1000_8000_00805f9b34fb);

/// CGM Specific Ops Control Point (write + indicate). Session start/stop.
pub const CGM_SPECIFIC_OPS: Uuid = Uuid::from_u128(0x00002aac_0000_1000_8000_00805f9b34fb);

/// Battery Level characteristic (read/notify), from the Battery service.
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// The set of channels one sensor profile exposes. The engine enumerates
/// `required_channels` at discovery and fails the connect when any is absent;
/// optional channels degrade gracefully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProfileDescriptor {
    pub name: &'static str,
    /// Live/historical measurement push channel (notify).
    pub measurement: Uuid,
    /// Record Access Control Point channel (write + indicate).
    pub racp: Uuid,
    /// One-shot status read channel.
    pub status: Uuid,
    /// One-shot feature read channel.
    pub feature: Uuid,
    /// Session start/stop control channel, when the profile has one.
    pub specific_ops: Option<Uuid>,
    /// Battery level channel, when the peripheral exposes one.
    pub battery: Option<Uuid>,
}

impl ProfileDescriptor {
    /// Channels that must be present for a session to be usable.
    pub fn required_channels(&self) -> Vec<Uuid> {
        vec![self.measurement, self.racp, self.status, self.feature]
    }
}

/// Continuous glucose sensor profile.
pub const CGM_PROFILE: ProfileDescriptor = ProfileDescriptor {
    name: "cgm",
    measurement: CGM_MEASUREMENT,
    racp: RECORD_ACCESS_CONTROL_POINT,
    status: CGM_STATUS,
    feature: CGM_FEATURE,
    specific_ops: Some(CGM_SPECIFIC_OPS),
    battery: Some(BATTERY_LEVEL),
};
