//! fleet-bus: publish/subscribe transport for fleet control messages.
//!
//! Channels are named strings carrying binary payloads. Every payload starts
//! with a one-byte message tag followed by length-prefixed strings and
//! varint integers (see [`codec`]).
//!
//! # Channels
//!
//! | Channel | Message | Producer → Consumer |
//! |---|---|---|
//! | `server-create` | [`BusMessage::ServerCreate`] | autoscaler → node daemon |
//! | `bungee-create` | [`BusMessage::BungeeCreate`] | autoscaler → node daemon |
//! | `server-shutdown-notif` | [`BusMessage::ServerShutdown`] | core → routing tier |
//! | `external-server-add` | [`BusMessage::ExternalServerAdd`] | core → routing tier |
//! | `teleport` | [`BusMessage::Teleport`] | tooling → routing tier |
//! | `teleport-type` | [`BusMessage::TeleportType`] | tooling → routing tier |
//! | `server-heartbeat` | [`BusMessage::ServerHeartbeat`] | workload agent → controller |
//!
//! The transport itself is abstracted behind [`MessageBus`];
//! [`InMemoryBus`] is the in-process implementation used by the standalone
//! daemon and by tests.

pub mod bus;
pub mod codec;
pub mod error;

pub use bus::{Handler, InMemoryBus, MessageBus, Subscription};
pub use codec::{BusMessage, channels};
pub use error::{BusError, BusResult, CodecError};

/// Maximum messages buffered per subscriber before it starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
