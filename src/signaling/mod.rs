pub mod adapter;
pub mod memory;
pub mod relay;
pub mod types;
pub mod websocket;

pub use adapter::{BoundSubscription, SignalingAdapter};
pub use memory::{MemoryRelay, MemoryRelayHub};
pub use relay::{RelaySubscription, SignalingRelay, Subscribers};
pub use types::{InboundSignal, OutboundSignal, RelayEvent, SignalKind, SignalPayload};
pub use websocket::WebSocketRelay;
