pub mod clock;
pub mod controller;
pub mod error;
pub mod gatt;
pub mod gatt_mock;
pub mod models;
pub mod profile;
pub mod session;
pub mod storage;
pub mod wire;

pub use clock::SessionClock;
pub use error::{ProtocolError, SessionError, TransportError};
pub use gatt::{GattTransport, SubscribeMode};
pub use gatt_mock::{MockExchange, MockTransport};
pub use models::{
    ConnectionEvent, Record, RequestStatus, RetrievalRequest, SessionSnapshot,
};
pub use profile::{ProfileDescriptor, CGM_PROFILE};
pub use session::{connect, SessionConfig, SessionHandle};
pub use storage::RecordStore;
