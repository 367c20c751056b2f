pub mod bus;
pub mod error;
pub mod message;
pub mod nats;

pub use bus::{Envelope, InMemoryBus, MessageBus, Subscription};
pub use error::BusError;
pub use message::{EntityId, LeadEventKind, OutboundMessage, QueueRequest};
pub use nats::NatsBus;
