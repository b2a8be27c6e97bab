//! fleet-state: the document store client for the fleet.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for networks, server types, routing types, nodes, instances,
//! external instances, and routing-tier instances.
//!
//! # Architecture
//!
//! Every entity is JSON-serialized into a `&str -> &[u8]` table keyed by its
//! id. Cross references (an instance's network, type, and node) are plain
//! ids; callers re-fetch instead of holding on to another entity.
//!
//! Queries are expressed as filters ([`InstanceFilter`],
//! [`RoutingFilter`]) combining field equality and inequality. Each write is
//! atomic for a single document only; there are no multi-document
//! transactions in the contract.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. The database file belongs to one
//! process at a time; everything else reaches the fleet through the bus.

pub mod error;
pub mod filter;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use filter::{InstanceFilter, RoutingFilter};
pub use store::StateStore;
pub use types::*;
