use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;
use crate::models::ConnectionEvent;

/// Subscription mode for a peripheral channel. Indications are acknowledged
/// by the link layer, notifications are not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeMode {
    Notify,
    Indicate,
}

/// Narrow interface to one connected peripheral. The engine consumes this;
/// real adapters (and their pairing/MTU negotiation) live outside the crate.
///
/// `write` models the control-point round trip: the returned future resolves
/// with the indication that answers the written command. The transport is
/// single-outstanding-request; the engine never assumes more than one write
/// per channel is in flight.
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// Verify every channel in `required` is present on the peripheral.
    async fn discover(&self, required: &[Uuid]) -> Result<(), TransportError>;

    /// Subscribe to a channel; delivered payloads arrive on the returned
    /// receiver until unsubscribe or disconnect.
    async fn subscribe(
        &self,
        channel: Uuid,
        mode: SubscribeMode,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    async fn unsubscribe(&self, channel: Uuid) -> Result<(), TransportError>;

    /// Write a control-point command and await the answering indication.
    async fn write(&self, channel: Uuid, payload: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    /// One-shot characteristic read.
    async fn read(&self, channel: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Connection-state change stream for this peripheral.
    async fn connection_events(&self) -> Result<mpsc::Receiver<ConnectionEvent>, TransportError>;
}
