//! fleet-autoscale: the reconciliation loop.
//!
//! Every tick walks the networks in the state store and drives each
//! `(network, server type)` pair toward its quota record.
//!
//! # Tick
//!
//! ```text
//! check transport      reconnect the bus if it dropped
//! for each network:
//!     collect garbage  crashed launches, heartbeat timeouts, types without a quota
//!     routing tier     deficit = desired - online, one exclusive placement per unit
//!     quotas           needed  = policy(type) clamped to max - online
//!                      needed > 0              -> dispatch launch jobs
//!                      default type, online>min -> retire empty instances
//! sleep(interval)
//! ```
//!
//! # Launch policies
//!
//! ```text
//! PlayerLoad:    threshold = 0.75 * max_players * online
//!                scale_up  = players > threshold ? floor(players / threshold) + 1 : 0
//!                needed    = max(0, min - online) + scale_up
//! Availability:  needed    = max(0, min - joinable)
//! External:      register one operator-managed instance when none exists
//! ```
//!
//! Launch decisions leave through a [`Dispatcher`]: straight into a local
//! deployment queue, or as create commands on the bus for per-host daemons.
//! What the loop sees of running instances arrives the other way, as
//! `server-heartbeat` messages applied by a [`HeartbeatListener`].

pub mod dispatch;
pub mod heartbeat;
pub mod policy;
pub mod scaler;

pub use dispatch::{BusDispatcher, Dispatcher, QueueDispatcher};
pub use heartbeat::{HeartbeatListener, heartbeat_from_message, heartbeat_message};
pub use scaler::{Autoscaler, TickReport};
