//! Real-time event distribution.
//!
//! Job handlers and API write paths call [`EventSink::publish`]; the
//! [`Broadcaster`] resolves the target scope to live sessions through the
//! [`ScopeIndex`] and pushes one pre-serialized frame into each session's
//! bounded [`Outbox`]. The [`SessionManager`] owns authentication, the
//! subscription sets and the authorization checks on both subscribe and
//! delivery.

pub mod bus;
pub mod event;
pub mod index;
pub mod outbox;
pub mod session;
pub mod wire;

pub use bus::{Broadcaster, BroadcasterHandle, EventBus, EventSink, InMemoryEventSink};
pub use event::Event;
pub use index::{ScopeConnections, ScopeIndex};
pub use outbox::{CloseReason, Outbox, OutboxItem, Pushed};
pub use session::{
    ConnectError, Delivery, Session, SessionInfo, SessionManager, SessionState, SubscribeError,
};
pub use wire::{ClientMessage, ControlFrame, WireError};
