pub mod error;
pub mod rendezvous;
pub mod session;

pub use error::ClientError;
pub use rendezvous::RendezvousClient;
pub use session::{SessionCommand, SessionDriver, SessionHandle, SessionOptions, SessionUpdate};
