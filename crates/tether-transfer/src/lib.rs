pub mod config;
pub mod connection;
pub mod consent;
pub mod error;
pub mod link;
pub mod logging;
pub mod memory;
pub mod protocol;
pub mod receiver;
pub mod reconciler;
pub mod sender;
pub mod throughput;

pub use config::{ConnectionConfig, Framing, TransferConfig};
pub use connection::{ConnectionAction, ConnectionEvent, ConnectionMachine, ConnectionState};
pub use consent::{ConsentDecision, ConsentGate, ConsentInbox, InboundRequest, PendingOffer};
pub use error::{LinkError, ProtocolViolation, SignalingError, TransferError};
pub use link::{LinkEvent, LinkFactory, LinkId, LinkNotice, PeerLink, Role};
pub use logging::{NullLogger, TracingLogger, TransferLogger};
pub use memory::{MemoryLink, MemoryLinkFactory, MemoryNetwork};
pub use receiver::{Artifact, ReceiveOutcome, TransferReceiver};
pub use sender::{CancelHandle, SendStep, TransferSender};
pub use throughput::{ThroughputMeter, TransferProgress};
