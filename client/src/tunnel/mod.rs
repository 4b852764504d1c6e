//! Circuit pool, tunnel dispatcher and the service task that drives them.

pub mod circuit;
pub mod direct;
pub mod dispatcher;
pub mod service;

pub use circuit::{Circuit, CircuitId, CircuitKind, CircuitPool, CircuitState, CircuitTransport};
pub use direct::DirectTransport;
pub use dispatcher::{SessionId, TunnelDispatcher};
pub use service::{CircuitEvent, DispatcherEvent, EventSender};
