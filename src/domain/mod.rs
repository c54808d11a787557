//! Domain layer: event model, channel broker, transport seam, and the
//! connection registry.

pub mod broker;
pub mod event;
pub mod registry;
pub mod transport;

pub use broker::{ChannelBroker, SubscriptionHandle};
pub use event::{Event, EventDraft, channels};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use transport::{EventTransport, InProcessTransport};
