//! Binary message codec.
//!
//! ```text
//! message := tag:u8 field*
//! string  := len:varint utf8-bytes[len]
//! int     := varint (little-endian base-128, at most 5 bytes)
//! flag    := u8 (0 or 1)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Longest string field accepted in either direction.
pub const MAX_STRING_BYTES: usize = 32_767;

/// Most metadata pairs a create command may carry.
pub const MAX_METADATA_ENTRIES: usize = 256;

/// Most players one heartbeat may list.
pub const MAX_PLAYER_ENTRIES: usize = 1024;

/// Channel names.
pub mod channels {
    pub const SERVER_CREATE: &str = "server-create";
    pub const BUNGEE_CREATE: &str = "bungee-create";
    pub const SERVER_SHUTDOWN: &str = "server-shutdown-notif";
    pub const EXTERNAL_SERVER_ADD: &str = "external-server-add";
    pub const TELEPORT: &str = "teleport";
    pub const TELEPORT_TYPE: &str = "teleport-type";
    pub const SERVER_HEARTBEAT: &str = "server-heartbeat";
}

const TAG_SERVER_CREATE: u8 = 1;
const TAG_BUNGEE_CREATE: u8 = 2;
const TAG_SERVER_SHUTDOWN: u8 = 3;
const TAG_EXTERNAL_SERVER_ADD: u8 = 4;
const TAG_TELEPORT: u8 = 5;
const TAG_TELEPORT_TYPE: u8 = 6;
const TAG_SERVER_HEARTBEAT: u8 = 7;

/// Every message that travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Launch one instance of `server_type` on `node`.
    ServerCreate {
        node: String,
        network: String,
        server_type: String,
        metadata: Vec<(String, String)>,
    },
    /// Launch a routing-tier instance on `node`.
    BungeeCreate {
        node: String,
        network: String,
        routing_type: String,
    },
    /// An instance record was removed.
    ServerShutdown { instance_id: String },
    /// An operator-managed instance was registered.
    ExternalServerAdd { instance_id: String },
    /// Move a player to a specific instance.
    Teleport { player: String, instance_id: String },
    /// Move a player to any instance of a type.
    TeleportType { player: String, server_type: String },
    /// Self-reported state from the workload agent of an instance.
    ///
    /// `port` 0 means the process has not bound one yet; `tps_centi` is the
    /// tick rate in hundredths.
    ServerHeartbeat {
        instance_id: String,
        ram_usage: u32,
        port: u16,
        tps_centi: u32,
        joinable: bool,
        /// `(id, name)` per online player.
        players: Vec<(String, String)>,
    },
}

impl BusMessage {
    /// The channel this message is published on.
    pub fn channel(&self) -> &'static str {
        match self {
            BusMessage::ServerCreate { .. } => channels::SERVER_CREATE,
            BusMessage::BungeeCreate { .. } => channels::BUNGEE_CREATE,
            BusMessage::ServerShutdown { .. } => channels::SERVER_SHUTDOWN,
            BusMessage::ExternalServerAdd { .. } => channels::EXTERNAL_SERVER_ADD,
            BusMessage::Teleport { .. } => channels::TELEPORT,
            BusMessage::TeleportType { .. } => channels::TELEPORT_TYPE,
            BusMessage::ServerHeartbeat { .. } => channels::SERVER_HEARTBEAT,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            BusMessage::ServerCreate { .. } => TAG_SERVER_CREATE,
            BusMessage::BungeeCreate { .. } => TAG_BUNGEE_CREATE,
            BusMessage::ServerShutdown { .. } => TAG_SERVER_SHUTDOWN,
            BusMessage::ExternalServerAdd { .. } => TAG_EXTERNAL_SERVER_ADD,
            BusMessage::Teleport { .. } => TAG_TELEPORT,
            BusMessage::TeleportType { .. } => TAG_TELEPORT_TYPE,
            BusMessage::ServerHeartbeat { .. } => TAG_SERVER_HEARTBEAT,
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut w = MessageWriter::new(self.tag());
        match self {
            BusMessage::ServerCreate {
                node,
                network,
                server_type,
                metadata,
            } => {
                w.write_string(node)?;
                w.write_string(network)?;
                w.write_string(server_type)?;
                if metadata.len() > MAX_METADATA_ENTRIES {
                    return Err(CodecError::TooManyEntries(metadata.len()));
                }
                w.write_varint(metadata.len() as u32);
                for (key, value) in metadata {
                    w.write_string(key)?;
                    w.write_string(value)?;
                }
            }
            BusMessage::BungeeCreate {
                node,
                network,
                routing_type,
            } => {
                w.write_string(node)?;
                w.write_string(network)?;
                w.write_string(routing_type)?;
            }
            BusMessage::ServerShutdown { instance_id }
            | BusMessage::ExternalServerAdd { instance_id } => {
                w.write_string(instance_id)?;
            }
            BusMessage::Teleport {
                player,
                instance_id,
            } => {
                w.write_string(player)?;
                w.write_string(instance_id)?;
            }
            BusMessage::TeleportType {
                player,
                server_type,
            } => {
                w.write_string(player)?;
                w.write_string(server_type)?;
            }
            BusMessage::ServerHeartbeat {
                instance_id,
                ram_usage,
                port,
                tps_centi,
                joinable,
                players,
            } => {
                w.write_string(instance_id)?;
                w.write_varint(*ram_usage);
                w.write_varint(u32::from(*port));
                w.write_varint(*tps_centi);
                w.buf.put_u8(u8::from(*joinable));
                if players.len() > MAX_PLAYER_ENTRIES {
                    return Err(CodecError::TooManyEntries(players.len()));
                }
                w.write_varint(players.len() as u32);
                for (id, name) in players {
                    w.write_string(id)?;
                    w.write_string(name)?;
                }
            }
        }
        Ok(w.finish())
    }

    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut r = MessageReader { buf: payload };
        let tag = r.read_u8()?;
        let msg = match tag {
            TAG_SERVER_CREATE => {
                let node = r.read_string()?;
                let network = r.read_string()?;
                let server_type = r.read_string()?;
                let count = r.read_varint()? as usize;
                if count > MAX_METADATA_ENTRIES {
                    return Err(CodecError::TooManyEntries(count));
                }
                let mut metadata = Vec::with_capacity(count);
                for _ in 0..count {
                    metadata.push((r.read_string()?, r.read_string()?));
                }
                BusMessage::ServerCreate {
                    node,
                    network,
                    server_type,
                    metadata,
                }
            }
            TAG_BUNGEE_CREATE => BusMessage::BungeeCreate {
                node: r.read_string()?,
                network: r.read_string()?,
                routing_type: r.read_string()?,
            },
            TAG_SERVER_SHUTDOWN => BusMessage::ServerShutdown {
                instance_id: r.read_string()?,
            },
            TAG_EXTERNAL_SERVER_ADD => BusMessage::ExternalServerAdd {
                instance_id: r.read_string()?,
            },
            TAG_TELEPORT => BusMessage::Teleport {
                player: r.read_string()?,
                instance_id: r.read_string()?,
            },
            TAG_TELEPORT_TYPE => BusMessage::TeleportType {
                player: r.read_string()?,
                server_type: r.read_string()?,
            },
            TAG_SERVER_HEARTBEAT => {
                let instance_id = r.read_string()?;
                let ram_usage = r.read_varint()?;
                let port = r.read_varint()?;
                let port = u16::try_from(port).map_err(|_| CodecError::OutOfRange(port))?;
                let tps_centi = r.read_varint()?;
                let joinable = match r.read_u8()? {
                    0 => false,
                    1 => true,
                    other => return Err(CodecError::InvalidFlag(other)),
                };
                let count = r.read_varint()? as usize;
                if count > MAX_PLAYER_ENTRIES {
                    return Err(CodecError::TooManyEntries(count));
                }
                let mut players = Vec::with_capacity(count);
                for _ in 0..count {
                    players.push((r.read_string()?, r.read_string()?));
                }
                BusMessage::ServerHeartbeat {
                    instance_id,
                    ram_usage,
                    port,
                    tps_centi,
                    joinable,
                    players,
                }
            }
            other => return Err(CodecError::UnknownTag(other)),
        };
        if r.buf.has_remaining() {
            return Err(CodecError::TrailingBytes(r.buf.remaining()));
        }
        Ok(msg)
    }
}

struct MessageWriter {
    buf: BytesMut,
}

impl MessageWriter {
    fn new(tag: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(tag);
        Self { buf }
    }

    fn write_varint(&mut self, mut value: u32) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    fn write_string(&mut self, s: &str) -> Result<(), CodecError> {
        if s.len() > MAX_STRING_BYTES {
            return Err(CodecError::StringTooLong(s.len()));
        }
        self.write_varint(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

struct MessageReader<'a> {
    buf: &'a [u8],
}

impl MessageReader<'_> {
    fn read_u8(&mut self) -> Result<u8, CodecError> {
        if !self.buf.has_remaining() {
            return Err(CodecError::UnexpectedEof);
        }
        Ok(self.buf.get_u8())
    }

    fn read_varint(&mut self) -> Result<u32, CodecError> {
        let mut value: u32 = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarIntTooLong)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_varint()? as usize;
        if len > MAX_STRING_BYTES {
            return Err(CodecError::StringTooLong(len));
        }
        if self.buf.remaining() < len {
            return Err(CodecError::UnexpectedEof);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        String::from_utf8(head.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_create_layout() {
        let msg = BusMessage::ServerCreate {
            node: "n1".to_string(),
            network: "prod".to_string(),
            server_type: "lobby".to_string(),
            metadata: vec![("map".to_string(), "castle".to_string())],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], TAG_SERVER_CREATE);
        // Length-prefixed node name follows the tag.
        assert_eq!(&bytes[1..4], &[2, b'n', b'1']);
        assert_eq!(BusMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn long_strings_use_multibyte_lengths() {
        let player = "p".repeat(300);
        let msg = BusMessage::TeleportType {
            player: player.clone(),
            server_type: "lobby".to_string(),
        };
        let bytes = msg.encode().unwrap();
        // 300 = 0b1_0010_1100 → [0xac, 0x02]
        assert_eq!(&bytes[1..3], &[0xac, 0x02]);
        assert_eq!(BusMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn oversize_string_fails_encoding() {
        let msg = BusMessage::ServerShutdown {
            instance_id: "x".repeat(MAX_STRING_BYTES + 1),
        };
        assert!(matches!(msg.encode(), Err(CodecError::StringTooLong(_))));
    }

    #[test]
    fn too_much_metadata_fails_encoding() {
        let msg = BusMessage::ServerCreate {
            node: "n1".to_string(),
            network: "prod".to_string(),
            server_type: "lobby".to_string(),
            metadata: vec![("k".to_string(), "v".to_string()); MAX_METADATA_ENTRIES + 1],
        };
        assert!(matches!(msg.encode(), Err(CodecError::TooManyEntries(_))));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = BusMessage::ExternalServerAdd {
            instance_id: "creative".to_string(),
        }
        .encode()
        .unwrap();
        assert_eq!(
            BusMessage::decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::UnexpectedEof)
        );
        assert_eq!(BusMessage::decode(&[]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn unknown_tag_and_trailing_bytes_are_rejected() {
        assert_eq!(BusMessage::decode(&[99]), Err(CodecError::UnknownTag(99)));

        let mut bytes = BusMessage::ServerShutdown {
            instance_id: "lobby1".to_string(),
        }
        .encode()
        .unwrap()
        .to_vec();
        bytes.push(0);
        assert_eq!(BusMessage::decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn heartbeat_layout() {
        let msg = BusMessage::ServerHeartbeat {
            instance_id: "lobby1".to_string(),
            ram_usage: 900,
            port: 32812,
            tps_centi: 1995,
            joinable: true,
            players: vec![("u1".to_string(), "Steve".to_string())],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], TAG_SERVER_HEARTBEAT);
        assert_eq!(msg.channel(), "server-heartbeat");
        assert_eq!(BusMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn heartbeat_rejects_bad_port_and_flag() {
        // id "a", ram 0, port 70000 (varint 0xf0 0xa2 0x04).
        let bad_port = [TAG_SERVER_HEARTBEAT, 1, b'a', 0, 0xf0, 0xa2, 0x04, 0, 1, 0];
        assert_eq!(
            BusMessage::decode(&bad_port),
            Err(CodecError::OutOfRange(70_000))
        );

        let bad_flag = [TAG_SERVER_HEARTBEAT, 1, b'a', 0, 0, 0, 2, 0];
        assert_eq!(BusMessage::decode(&bad_flag), Err(CodecError::InvalidFlag(2)));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert_eq!(
            BusMessage::decode(&[TAG_SERVER_SHUTDOWN, 2, 0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        );
    }

    #[test]
    fn channel_names_match_wire_contract() {
        let msg = BusMessage::BungeeCreate {
            node: "n1".to_string(),
            network: "prod".to_string(),
            routing_type: "proxy".to_string(),
        };
        assert_eq!(msg.channel(), "bungee-create");
        assert_eq!(
            BusMessage::ServerShutdown {
                instance_id: String::new()
            }
            .channel(),
            "server-shutdown-notif"
        );
    }
}
