//! # caravan-node
//!
//! One container of the caravan agent platform. A container hosts agent
//! instances, routes messages to their inboxes, and runs the mobility
//! protocol that moves and clones live agents between containers.
//!
//! ## Architecture
//!
//! - **Local agent directory**: the agents hosted here, each behind its own
//!   exclusive lock
//! - **Global agent directory**: the platform-wide name map, present on the
//!   main container only
//! - **Relocation transaction**: the phased move/clone state machine with
//!   phase-keyed rollback
//! - **Code store**: serves code modules to containers materializing this
//!   container's agents
//! - **Transport**: length-prefixed JSON frames over TCP, one cached
//!   connection per peer

pub mod agent;
pub mod codefetch;
pub mod config;
pub mod gadt;
pub mod ladt;
pub mod node;
pub mod policy;
pub mod transaction;
pub mod transport;

pub use agent::{AgentInstance, AgentState, Inbox, Movable, NoHooks};
pub use config::Config;
pub use gadt::{GadtEntry, GlobalAgentDirectory};
pub use ladt::{AgentGuard, LocalAgentDirectory};
pub use node::ContainerNode;
pub use policy::{AllowAll, DenyAll, MobilityPolicy};
pub use transport::{
    call_with_retry, probe_alive, serve, AddressBook, CommandHandler, TcpTransport, Transport,
};
