//! Scripted in-memory transport for exercising the engine without radio
//! hardware.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::gatt::{GattTransport, SubscribeMode};
use crate::models::ConnectionEvent;
use crate::profile::CGM_PROFILE;

const CHANNEL_CAPACITY: usize = 256;

/// One scripted control-point round trip: notifications delivered while the
/// write is outstanding, then the answering indication (or failure).
#[derive(Clone, Debug)]
pub struct MockExchange {
    pub notify_before_response: Vec<(Uuid, Vec<u8>)>,
    pub response: Result<Vec<u8>, TransportError>,
    /// Never resolve the write; used to exercise timeouts and aborts.
    pub hang: bool,
}

impl MockExchange {
    pub fn respond(response: Vec<u8>) -> Self {
        Self {
            notify_before_response: Vec::new(),
            response: Ok(response),
            hang: false,
        }
    }

    pub fn deliver_then_respond(notify: Vec<(Uuid, Vec<u8>)>, response: Vec<u8>) -> Self {
        Self {
            notify_before_response: notify,
            response: Ok(response),
            hang: false,
        }
    }

    pub fn fail(error: TransportError) -> Self {
        Self {
            notify_before_response: Vec::new(),
            response: Err(error),
            hang: false,
        }
    }

    pub fn hang() -> Self {
        Self {
            notify_before_response: Vec::new(),
            response: Ok(Vec::new()),
            hang: true,
        }
    }
}

#[derive(Default)]
struct Inner {
    channels: Vec<Uuid>,
    reads: HashMap<Uuid, Vec<u8>>,
    subscriptions: HashMap<Uuid, mpsc::Sender<Vec<u8>>>,
    exchanges: VecDeque<MockExchange>,
    events: Option<mpsc::Sender<ConnectionEvent>>,
    writes: Vec<(Uuid, Vec<u8>)>,
}

/// In-memory [`GattTransport`] driven entirely by scripted exchanges.
#[derive(Default)]
pub struct MockTransport {
    inner: Mutex<Inner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock peripheral exposing every CGM channel, with a no-frills feature
    /// set, a running session at offset zero, and a full battery.
    pub fn with_cgm_defaults() -> Self {
        let mock = Self::new();
        {
            let mut inner = mock.inner.lock().unwrap();
            inner.channels = vec![
                CGM_PROFILE.measurement,
                CGM_PROFILE.racp,
                CGM_PROFILE.status,
                CGM_PROFILE.feature,
                CGM_PROFILE.specific_ops.unwrap(),
                CGM_PROFILE.battery.unwrap(),
            ];
            inner
                .reads
                .insert(CGM_PROFILE.feature, vec![0x00, 0x00, 0x00, 0x15, 0xFF, 0xFF]);
            inner
                .reads
                .insert(CGM_PROFILE.status, vec![0x00, 0x00, 0x00, 0x00, 0x00]);
            inner.reads.insert(CGM_PROFILE.battery.unwrap(), vec![100]);
        }
        mock
    }

    pub fn expose_channels(&self, channels: &[Uuid]) {
        self.inner.lock().unwrap().channels = channels.to_vec();
    }

    pub fn set_read(&self, channel: Uuid, payload: Vec<u8>) {
        self.inner.lock().unwrap().reads.insert(channel, payload);
    }

    /// Queue the next control-point exchange; writes consume them in order.
    pub fn script_exchange(&self, exchange: MockExchange) {
        self.inner.lock().unwrap().exchanges.push_back(exchange);
    }

    /// Push a spontaneous notification to a subscribed channel.
    pub fn push_notification(&self, channel: Uuid, payload: Vec<u8>) {
        let inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.subscriptions.get(&channel) {
            let _ = tx.try_send(payload);
        }
    }

    /// Emit a connection-state event to the engine.
    pub fn emit(&self, event: ConnectionEvent) {
        let inner = self.inner.lock().unwrap();
        if let Some(tx) = &inner.events {
            let _ = tx.try_send(event);
        }
    }

    /// Every write seen so far, in order.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.inner.lock().unwrap().writes.clone()
    }
}

#[async_trait]
impl GattTransport for MockTransport {
    async fn discover(&self, required: &[Uuid]) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap();
        for channel in required {
            if !inner.channels.contains(channel) {
                return Err(TransportError::ServiceUnsupported(*channel));
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: Uuid,
        _mode: SubscribeMode,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.channels.contains(&channel) {
            return Err(TransportError::ServiceUnsupported(channel));
        }
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        inner.subscriptions.insert(channel, tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: Uuid) -> Result<(), TransportError> {
        self.inner.lock().unwrap().subscriptions.remove(&channel);
        Ok(())
    }

    async fn write(&self, channel: Uuid, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let (exchange, senders) = {
            let mut inner = self.inner.lock().unwrap();
            inner.writes.push((channel, payload));
            let exchange = inner.exchanges.pop_front();
            let senders: HashMap<Uuid, mpsc::Sender<Vec<u8>>> = inner.subscriptions.clone();
            (exchange, senders)
        };

        let exchange = exchange.ok_or_else(|| TransportError::WriteRejected {
            channel,
            reason: "no scripted exchange".to_string(),
        })?;

        for (target, payload) in exchange.notify_before_response {
            if let Some(tx) = senders.get(&target) {
                let _ = tx.try_send(payload);
            }
        }

        if exchange.hang {
            futures::future::pending::<()>().await;
        }

        exchange.response
    }

    async fn read(&self, channel: Uuid) -> Result<Vec<u8>, TransportError> {
        let inner = self.inner.lock().unwrap();
        inner
            .reads
            .get(&channel)
            .cloned()
            .ok_or_else(|| TransportError::ReadRejected {
                channel,
                reason: "no scripted read".to_string(),
            })
    }

    async fn connection_events(&self) -> Result<mpsc::Receiver<ConnectionEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.inner.lock().unwrap().events = Some(tx);
        Ok(rx)
    }
}
