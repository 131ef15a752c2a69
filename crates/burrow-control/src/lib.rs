//! Agent sessions, registry and request dispatch
//!
//! One [`AgentSession`] exists per connected tunnel. The [`AgentRegistry`]
//! indexes sessions by agent name and endpoint, picks one for each inbound
//! transaction, and owns the dispatch (`send`/`cancel`) semantics.

pub mod registry;
pub mod session;
pub mod tunnel;

pub use registry::{AgentRegistry, AgentSearch, AgentStatistics, DispatchError};
pub use session::AgentSession;
pub use tunnel::{serve_agent_tunnel, TunnelConfig, TunnelError};
