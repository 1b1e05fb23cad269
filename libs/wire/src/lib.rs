//! # caravan-wire
//!
//! The shared protocol vocabulary for the caravan mobility platform: the
//! closed command set exchanged between containers, the versioned agent
//! snapshot, inbound message units, life-cycle markers, and the error
//! taxonomy.
//!
//! Every remote operation is a variant of [`Command`] and every failure a
//! variant of [`MobilityError`], so peers always exchange typed outcomes and
//! dispatch is an exhaustive match rather than a string-keyed lookup.

mod command;
mod envelope;
mod error;
mod snapshot;

pub use command::{Command, RelocateMode, RelocateOutcome, Reply, TransferVerdict};
pub use envelope::{Envelope, ReplyEnvelope};
pub use error::MobilityError;
pub use snapshot::{AgentMessage, AgentSnapshot, LifeCycleState, SNAPSHOT_VERSION};
