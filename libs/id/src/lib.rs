//! # stratus-id
//!
//! Identifier types for resources managed through the cloud control plane.
//!
//! ## Design Principles
//!
//! - IDs are assigned by the remote control plane and treated as opaque
//! - All IDs are validated on construction (non-empty, no whitespace, bounded length)
//! - IDs support roundtrip serialization (parse → format → parse)
//! - IDs are typed so an owner can never be passed where an entity is expected
//!
//! ## ID Kinds
//!
//! - [`OwnerId`]: the parent resource whose nested collection is reconciled
//!   (a server, a network domain)
//! - [`EntityId`]: a nested entity inside an owner's namespace (a disk, an
//!   adapter, a firewall rule)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
