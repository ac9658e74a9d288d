//! # fleetsim-id
//!
//! Typed identifiers for the resources tracked by the fleetsim control plane.
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `pod_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//!
//! IDs are ordered by their ULID, so sorting a set of node IDs yields the
//! order in which the nodes were created. The scheduler relies on this
//! ordering for deterministic placement.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
