//! The realtime broker: wire protocol, per-document agents, and the
//! connection hub.
//!
//! Transport is someone else's problem: the server crate pumps WebSocket
//! (and SSE) frames in and out, while this crate owns the protocol
//! semantics:
//! handshake, subscription registry, per-document serialisation through
//! agent mailboxes, version-strict broadcast, backpressure, and timeouts.

pub mod agent;
pub mod hub;
pub mod protocol;

pub use agent::{AgentMsg, Outbound, Snapshot};
pub use hub::{Hub, HubConfig};
pub use protocol::{action, ErrorPayload, Frame, OT_TYPE, PROTOCOL_VERSION};
