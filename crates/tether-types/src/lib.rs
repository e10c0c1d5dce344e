pub mod events;
pub mod models;

pub use events::{RendezvousCommand, RendezvousEvent, SignalKind, SignalPayload};
pub use models::{PeerId, TransferMetadata};
