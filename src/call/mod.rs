pub mod coordinator;
pub mod session;
pub mod state;

pub use coordinator::{CallCoordinator, CallEvents, CallHandle};
pub use session::PendingSignals;
pub use state::{CallEvent, CallState, EndReason};
