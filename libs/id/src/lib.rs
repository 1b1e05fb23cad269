//! # caravan-id
//!
//! Identity types, parsing, and validation for the caravan mobility platform.
//!
//! ## Design Principles
//!
//! - Agent and container identities are globally unique, human-readable names
//! - Names are immutable once assigned; cloning mints a new name
//! - All identities have a canonical string representation with strict parsing
//! - Identities support roundtrip serialization (parse → format → parse)
//! - Identities are typed to prevent mixing agents and containers
//!
//! ## Name Format
//!
//! Names are 1–64 characters drawn from `[A-Za-z0-9._-]`:
//!
//! - `trader-7`
//! - `container.eu-west.2`
//!
//! Request correlation ids keep a prefixed ULID format (`req_{ulid}`) so
//! in-flight exchanges stay time-sortable and unique.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
