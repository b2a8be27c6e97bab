//! fleet-placement: picks the host for a new instance.
//!
//! This crate only decides *where* an instance goes. Launching it is the
//! deployment queue's job (`fleet-deployer`), and deciding *how many* is the
//! autoscaler's (`fleet-autoscale`).
//!
//! # Components
//!
//! - **`load`**: per-node capacity snapshot built from the state store
//! - **`placer`**: selection rules and the per-tick exclusivity set

pub mod load;
pub mod placer;

pub use load::{NodeLoad, node_loads};
pub use placer::{NodePlacer, PlacementError, PlacementRequest, select};
