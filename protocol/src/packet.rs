//! The packet codec. Every packet serializes into a frame of exactly
//! [`PACKET_SIZE`] bytes: a type tag, a sender-assigned sequence number, the
//! 128 bit sender identity, a wall-clock timestamp and the type-specific
//! payload, zero-padded to the frame size.
//!
//! The layout is big-endian throughout:
//!
//! ```text
//! offset 0   type: u8
//! offset 1   sequence: u32
//! offset 5   sender: u128
//! offset 21  timestamp: u32 (seconds)
//! offset 25  payload, zero-padded to PACKET_SIZE
//! ```
//!
//! Deserialization is strict: unknown tags, short buffers, oversized
//! strings and non-finite floats are all rejected with a [`PacketError`] so
//! that the transport layer can drop the frame without touching game state.

use crate::{
    AuthAction, BoardAction, Color, GameEventKind, GameMode, HistoryAction, ItemAction, ItemKind,
    LobbyCommand, LobbyStatus, MAX_FILENAME_LEN, MAX_MESSAGE_LEN, MAX_NAME_LEN, MAX_PASSWORD_LEN,
    PACKET_SIZE, PacketType, PlayerId, ProjectileAction, QueueAction, Transport,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Everything that can go wrong while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("frame too short: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },
    #[error("unknown packet type tag {0}")]
    UnknownType(u8),
    #[error("invalid value {value} for {field}")]
    BadValue { field: &'static str, value: u8 },
    #[error("string {field} exceeds {max} bytes")]
    StringTooLong { field: &'static str, max: usize },
    #[error("string {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },
    #[error("non-finite float in {field}")]
    NonFiniteFloat { field: &'static str },
}

/// The type-specific payload of a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    AuthRequest {
        action: AuthAction,
        username: String,
        password: String,
    },
    AuthResponse {
        success: bool,
        assigned_id: PlayerId,
        message: String,
    },
    PlayerJoin {
        x: u16,
        y: u16,
        color: Color,
        name: String,
        health: u16,
        max_health: u16,
        character_id: u8,
        team_id: u8,
    },
    PlayerLeave,
    PlayerUpdate {
        x: u16,
        y: u16,
        color: Color,
        health: u16,
        charge: u8,
        effects: u8,
        character_id: u8,
        team_id: u8,
    },
    Heartbeat,
    ProjectileUpdate {
        action: ProjectileAction,
        x: f32,
        y: f32,
        dx: f32,
        dy: f32,
        color: Color,
        id: u32,
        target: PlayerId,
        charge: u8,
        kind: u8,
    },
    ItemUpdate {
        action: ItemAction,
        x: u16,
        y: u16,
        kind: ItemKind,
        id: u32,
    },
    TileUpdate {
        x: u16,
        y: u16,
        tile: u8,
    },
    WorldInfo {
        filename: String,
    },
    LobbyAction {
        action: LobbyCommand,
        lobby: u32,
        map_index: u8,
        duration_min: u8,
        max_players: u8,
        player_count: u8,
        status: LobbyStatus,
        name: String,
        character_id: u8,
        game_mode: GameMode,
        team_size: u8,
    },
    GameEvent {
        event: GameEventKind,
        remaining_s: u32,
        kills: u32,
        deaths: u32,
        target: PlayerId,
        rank: u16,
        spawn_x: u16,
        spawn_y: u16,
        team_id: u8,
    },
    RankedQueue {
        action: QueueAction,
        character_id: u8,
        queue_size: u16,
        elo: u32,
        wait_s: u32,
        mode: GameMode,
        lobby: u32,
    },
    MatchHistory {
        action: HistoryAction,
        map_index: u8,
        duration_min: u8,
        kills: u32,
        deaths: u32,
        rank: u16,
        played_at: u32,
        total_matches: u32,
        total_wins: u32,
    },
    Leaderboard {
        action: BoardAction,
        rank: u16,
        elo: u32,
        wins: u32,
        matches: u32,
        username: String,
    },
}

impl Payload {
    /// The wire tag this payload serializes under.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::AuthRequest { .. } => PacketType::AuthRequest,
            Payload::AuthResponse { .. } => PacketType::AuthResponse,
            Payload::PlayerJoin { .. } => PacketType::PlayerJoin,
            Payload::PlayerLeave => PacketType::PlayerLeave,
            Payload::PlayerUpdate { .. } => PacketType::PlayerUpdate,
            Payload::Heartbeat => PacketType::Heartbeat,
            Payload::ProjectileUpdate { .. } => PacketType::ProjectileUpdate,
            Payload::ItemUpdate { .. } => PacketType::ItemUpdate,
            Payload::TileUpdate { .. } => PacketType::TileUpdate,
            Payload::WorldInfo { .. } => PacketType::WorldInfo,
            Payload::LobbyAction { .. } => PacketType::LobbyAction,
            Payload::GameEvent { .. } => PacketType::GameEvent,
            Payload::RankedQueue { .. } => PacketType::RankedQueue,
            Payload::MatchHistory { .. } => PacketType::MatchHistory,
            Payload::Leaderboard { .. } => PacketType::Leaderboard,
        }
    }
}

/// One decoded packet: header plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Monotonic sender-assigned sequence number.
    pub sequence: u32,
    /// The sender identity, zero when not yet authenticated.
    pub sender: PlayerId,
    /// Wall-clock seconds at send time.
    pub timestamp: u32,
    pub payload: Payload,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }

    /// The channel this packet must travel on.
    pub fn transport(&self) -> Transport {
        self.packet_type().transport()
    }

    /// Serializes into a frame of exactly [`PACKET_SIZE`] bytes.
    pub fn serialize(&self) -> Bytes {
        let mut msg = BytesMut::with_capacity(PACKET_SIZE);
        msg.put_u8(self.packet_type() as u8);
        msg.put_u32(self.sequence);
        msg.put_u128(self.sender.0);
        msg.put_u32(self.timestamp);

        match &self.payload {
            Payload::AuthRequest {
                action,
                username,
                password,
            } => {
                msg.put_u8(*action as u8);
                put_str(&mut msg, username, MAX_NAME_LEN);
                put_str(&mut msg, password, MAX_PASSWORD_LEN);
            }
            Payload::AuthResponse {
                success,
                assigned_id,
                message,
            } => {
                msg.put_u8(u8::from(*success));
                msg.put_u128(assigned_id.0);
                put_str(&mut msg, message, MAX_MESSAGE_LEN);
            }
            Payload::PlayerJoin {
                x,
                y,
                color,
                name,
                health,
                max_health,
                character_id,
                team_id,
            } => {
                msg.put_u16(*x);
                msg.put_u16(*y);
                put_color(&mut msg, *color);
                put_str(&mut msg, name, MAX_NAME_LEN);
                msg.put_u16(*health);
                msg.put_u16(*max_health);
                msg.put_u8(*character_id);
                msg.put_u8(*team_id);
            }
            Payload::PlayerLeave | Payload::Heartbeat => {}
            Payload::PlayerUpdate {
                x,
                y,
                color,
                health,
                charge,
                effects,
                character_id,
                team_id,
            } => {
                msg.put_u16(*x);
                msg.put_u16(*y);
                put_color(&mut msg, *color);
                msg.put_u16(*health);
                msg.put_u8(*charge);
                msg.put_u8(*effects);
                msg.put_u8(*character_id);
                msg.put_u8(*team_id);
            }
            Payload::ProjectileUpdate {
                action,
                x,
                y,
                dx,
                dy,
                color,
                id,
                target,
                charge,
                kind,
            } => {
                msg.put_u8(*action as u8);
                msg.put_f32(*x);
                msg.put_f32(*y);
                msg.put_f32(*dx);
                msg.put_f32(*dy);
                put_color(&mut msg, *color);
                msg.put_u32(*id);
                msg.put_u128(target.0);
                msg.put_u8(*charge);
                msg.put_u8(*kind);
            }
            Payload::ItemUpdate {
                action,
                x,
                y,
                kind,
                id,
            } => {
                msg.put_u8(*action as u8);
                msg.put_u16(*x);
                msg.put_u16(*y);
                msg.put_u8(*kind as u8);
                msg.put_u32(*id);
            }
            Payload::TileUpdate { x, y, tile } => {
                msg.put_u16(*x);
                msg.put_u16(*y);
                msg.put_u8(*tile);
            }
            Payload::WorldInfo { filename } => {
                put_str(&mut msg, filename, MAX_FILENAME_LEN);
            }
            Payload::LobbyAction {
                action,
                lobby,
                map_index,
                duration_min,
                max_players,
                player_count,
                status,
                name,
                character_id,
                game_mode,
                team_size,
            } => {
                msg.put_u8(*action as u8);
                msg.put_u32(*lobby);
                msg.put_u8(*map_index);
                msg.put_u8(*duration_min);
                msg.put_u8(*max_players);
                msg.put_u8(*player_count);
                msg.put_u8(*status as u8);
                put_str(&mut msg, name, MAX_NAME_LEN);
                msg.put_u8(*character_id);
                msg.put_u8(*game_mode as u8);
                msg.put_u8(*team_size);
            }
            Payload::GameEvent {
                event,
                remaining_s,
                kills,
                deaths,
                target,
                rank,
                spawn_x,
                spawn_y,
                team_id,
            } => {
                msg.put_u8(*event as u8);
                msg.put_u32(*remaining_s);
                msg.put_u32(*kills);
                msg.put_u32(*deaths);
                msg.put_u128(target.0);
                msg.put_u16(*rank);
                msg.put_u16(*spawn_x);
                msg.put_u16(*spawn_y);
                msg.put_u8(*team_id);
            }
            Payload::RankedQueue {
                action,
                character_id,
                queue_size,
                elo,
                wait_s,
                mode,
                lobby,
            } => {
                msg.put_u8(*action as u8);
                msg.put_u8(*character_id);
                msg.put_u16(*queue_size);
                msg.put_u32(*elo);
                msg.put_u32(*wait_s);
                msg.put_u8(*mode as u8);
                msg.put_u32(*lobby);
            }
            Payload::MatchHistory {
                action,
                map_index,
                duration_min,
                kills,
                deaths,
                rank,
                played_at,
                total_matches,
                total_wins,
            } => {
                msg.put_u8(*action as u8);
                msg.put_u8(*map_index);
                msg.put_u8(*duration_min);
                msg.put_u32(*kills);
                msg.put_u32(*deaths);
                msg.put_u16(*rank);
                msg.put_u32(*played_at);
                msg.put_u32(*total_matches);
                msg.put_u32(*total_wins);
            }
            Payload::Leaderboard {
                action,
                rank,
                elo,
                wins,
                matches,
                username,
            } => {
                msg.put_u8(*action as u8);
                msg.put_u16(*rank);
                msg.put_u32(*elo);
                msg.put_u32(*wins);
                msg.put_u32(*matches);
                put_str(&mut msg, username, MAX_NAME_LEN);
            }
        }

        debug_assert!(msg.len() <= PACKET_SIZE, "payload overflows the frame");
        msg.resize(PACKET_SIZE, 0);
        msg.freeze()
    }

    /// Decodes one frame. The buffer must hold at least [`PACKET_SIZE`]
    /// bytes; trailing bytes beyond the frame are ignored.
    pub fn deserialize(frame: &[u8]) -> Result<Packet, PacketError> {
        if frame.len() < PACKET_SIZE {
            return Err(PacketError::Truncated {
                got: frame.len(),
                need: PACKET_SIZE,
            });
        }
        let mut buf = &frame[..PACKET_SIZE];
        let tag = buf.get_u8();
        let ty = PacketType::try_from(tag).map_err(PacketError::UnknownType)?;
        let sequence = buf.get_u32();
        let sender = PlayerId(buf.get_u128());
        let timestamp = buf.get_u32();

        let payload = match ty {
            PacketType::AuthRequest => Payload::AuthRequest {
                action: get_enum(&mut buf, "auth action")?,
                username: get_str(&mut buf, MAX_NAME_LEN, "username")?,
                password: get_str(&mut buf, MAX_PASSWORD_LEN, "password")?,
            },
            PacketType::AuthResponse => Payload::AuthResponse {
                success: buf.get_u8() != 0,
                assigned_id: PlayerId(buf.get_u128()),
                message: get_str(&mut buf, MAX_MESSAGE_LEN, "message")?,
            },
            PacketType::PlayerJoin => Payload::PlayerJoin {
                x: buf.get_u16(),
                y: buf.get_u16(),
                color: get_color(&mut buf),
                name: get_str(&mut buf, MAX_NAME_LEN, "name")?,
                health: buf.get_u16(),
                max_health: buf.get_u16(),
                character_id: buf.get_u8(),
                team_id: buf.get_u8(),
            },
            PacketType::PlayerLeave => Payload::PlayerLeave,
            PacketType::PlayerUpdate => Payload::PlayerUpdate {
                x: buf.get_u16(),
                y: buf.get_u16(),
                color: get_color(&mut buf),
                health: buf.get_u16(),
                charge: buf.get_u8(),
                effects: buf.get_u8(),
                character_id: buf.get_u8(),
                team_id: buf.get_u8(),
            },
            PacketType::Heartbeat => Payload::Heartbeat,
            PacketType::ProjectileUpdate => Payload::ProjectileUpdate {
                action: get_enum(&mut buf, "projectile action")?,
                x: get_f32_finite(&mut buf, "x")?,
                y: get_f32_finite(&mut buf, "y")?,
                dx: get_f32_finite(&mut buf, "dx")?,
                dy: get_f32_finite(&mut buf, "dy")?,
                color: get_color(&mut buf),
                id: buf.get_u32(),
                target: PlayerId(buf.get_u128()),
                charge: buf.get_u8(),
                kind: buf.get_u8(),
            },
            PacketType::ItemUpdate => Payload::ItemUpdate {
                action: get_enum(&mut buf, "item action")?,
                x: buf.get_u16(),
                y: buf.get_u16(),
                kind: get_enum(&mut buf, "item kind")?,
                id: buf.get_u32(),
            },
            PacketType::TileUpdate => Payload::TileUpdate {
                x: buf.get_u16(),
                y: buf.get_u16(),
                tile: buf.get_u8(),
            },
            PacketType::WorldInfo => Payload::WorldInfo {
                filename: get_str(&mut buf, MAX_FILENAME_LEN, "filename")?,
            },
            PacketType::LobbyAction => Payload::LobbyAction {
                action: get_enum(&mut buf, "lobby action")?,
                lobby: buf.get_u32(),
                map_index: buf.get_u8(),
                duration_min: buf.get_u8(),
                max_players: buf.get_u8(),
                player_count: buf.get_u8(),
                status: get_enum(&mut buf, "lobby status")?,
                name: get_str(&mut buf, MAX_NAME_LEN, "lobby name")?,
                character_id: buf.get_u8(),
                game_mode: get_enum(&mut buf, "game mode")?,
                team_size: buf.get_u8(),
            },
            PacketType::GameEvent => Payload::GameEvent {
                event: get_enum(&mut buf, "game event")?,
                remaining_s: buf.get_u32(),
                kills: buf.get_u32(),
                deaths: buf.get_u32(),
                target: PlayerId(buf.get_u128()),
                rank: buf.get_u16(),
                spawn_x: buf.get_u16(),
                spawn_y: buf.get_u16(),
                team_id: buf.get_u8(),
            },
            PacketType::RankedQueue => Payload::RankedQueue {
                action: get_enum(&mut buf, "queue action")?,
                character_id: buf.get_u8(),
                queue_size: buf.get_u16(),
                elo: buf.get_u32(),
                wait_s: buf.get_u32(),
                mode: get_enum(&mut buf, "game mode")?,
                lobby: buf.get_u32(),
            },
            PacketType::MatchHistory => Payload::MatchHistory {
                action: get_enum(&mut buf, "history action")?,
                map_index: buf.get_u8(),
                duration_min: buf.get_u8(),
                kills: buf.get_u32(),
                deaths: buf.get_u32(),
                rank: buf.get_u16(),
                played_at: buf.get_u32(),
                total_matches: buf.get_u32(),
                total_wins: buf.get_u32(),
            },
            PacketType::Leaderboard => Payload::Leaderboard {
                action: get_enum(&mut buf, "board action")?,
                rank: buf.get_u16(),
                elo: buf.get_u32(),
                wins: buf.get_u32(),
                matches: buf.get_u32(),
                username: get_str(&mut buf, MAX_NAME_LEN, "username")?,
            },
        };

        Ok(Packet {
            sequence,
            sender,
            timestamp,
            payload,
        })
    }
}

/// Writes a length-prefixed string, truncating on a char boundary if the
/// caller hands in more than `max` bytes.
fn put_str(msg: &mut BytesMut, s: &str, max: usize) {
    debug_assert!(s.len() <= max, "oversized string reached the codec");
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    msg.put_u8(end as u8);
    msg.put_slice(&s.as_bytes()[..end]);
}

fn get_str(buf: &mut &[u8], max: usize, field: &'static str) -> Result<String, PacketError> {
    if buf.remaining() < 1 {
        return Err(PacketError::Truncated { got: 0, need: 1 });
    }
    let len = buf.get_u8() as usize;
    if len > max {
        return Err(PacketError::StringTooLong { field, max });
    }
    if buf.remaining() < len {
        return Err(PacketError::Truncated {
            got: buf.remaining(),
            need: len,
        });
    }
    let raw = buf[..len].to_vec();
    buf.advance(len);
    String::from_utf8(raw).map_err(|_| PacketError::InvalidUtf8 { field })
}

fn put_color(msg: &mut BytesMut, color: Color) {
    msg.put_u8(color.r);
    msg.put_u8(color.g);
    msg.put_u8(color.b);
}

fn get_color(buf: &mut &[u8]) -> Color {
    Color {
        r: buf.get_u8(),
        g: buf.get_u8(),
        b: buf.get_u8(),
    }
}

fn get_enum<T>(buf: &mut &[u8], field: &'static str) -> Result<T, PacketError>
where
    T: TryFrom<u8, Error = u8>,
{
    let raw = buf.get_u8();
    T::try_from(raw).map_err(|value| PacketError::BadValue { field, value })
}

fn get_f32_finite(buf: &mut &[u8], field: &'static str) -> Result<f32, PacketError> {
    let value = buf.get_f32();
    if value.is_finite() {
        Ok(value)
    } else {
        Err(PacketError::NonFiniteFloat { field })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(payload: Payload) -> Bytes {
        Packet {
            sequence: 7,
            sender: PlayerId(0xABCD_EF00_1122_3344_5566_7788_99AA_BBCC),
            timestamp: 1_700_000,
            payload,
        }
        .serialize()
    }

    #[test]
    fn header_layout_is_stable() {
        let frame = frame_of(Payload::Heartbeat);
        assert_eq!(frame.len(), PACKET_SIZE);
        assert_eq!(frame[0], PacketType::Heartbeat as u8);
        assert_eq!(&frame[1..5], 7u32.to_be_bytes());
        assert_eq!(
            &frame[5..21],
            0xABCD_EF00_1122_3344_5566_7788_99AA_BBCCu128.to_be_bytes()
        );
        assert_eq!(&frame[21..25], 1_700_000u32.to_be_bytes());
        // Everything past the empty payload is padding.
        assert!(frame[25..].iter().all(|b| *b == 0));
    }

    #[test]
    fn auth_request_round_trips() {
        let payload = Payload::AuthRequest {
            action: AuthAction::Register,
            username: "sable".into(),
            password: "hunter2!".into(),
        };
        let frame = frame_of(payload.clone());
        let decoded = Packet::deserialize(&frame).unwrap();
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.sequence, 7);
    }

    #[test]
    fn projectile_update_round_trips_and_rejects_nan() {
        let payload = Payload::ProjectileUpdate {
            action: ProjectileAction::Spawn,
            x: 10.5,
            y: 3.25,
            dx: -1.0,
            dy: 0.5,
            color: Color::new(200, 40, 40),
            id: 91,
            target: PlayerId::ZERO,
            charge: 55,
            kind: 2,
        };
        let frame = frame_of(payload.clone());
        assert_eq!(Packet::deserialize(&frame).unwrap().payload, payload);

        // Patch the dx field (offset 25 + 1 action + 8 for x/y) to NaN.
        let mut bad = frame.to_vec();
        bad[34..38].copy_from_slice(&f32::NAN.to_be_bytes());
        assert_eq!(
            Packet::deserialize(&bad),
            Err(PacketError::NonFiniteFloat { field: "dx" })
        );
    }

    #[test]
    fn lobby_action_round_trips() {
        let payload = Payload::LobbyAction {
            action: LobbyCommand::Create,
            lobby: 0,
            map_index: 1,
            duration_min: 5,
            max_players: 6,
            player_count: 0,
            status: LobbyStatus::Waiting,
            name: "late night ffa".into(),
            character_id: 2,
            game_mode: GameMode::Teams,
            team_size: 3,
        };
        let frame = frame_of(payload.clone());
        assert_eq!(Packet::deserialize(&frame).unwrap().payload, payload);
    }

    #[test]
    fn game_event_round_trips() {
        let payload = Payload::GameEvent {
            event: GameEventKind::Kill,
            remaining_s: 55,
            kills: 3,
            deaths: 1,
            target: PlayerId(42 << 64 | 7),
            rank: 0,
            spawn_x: 0,
            spawn_y: 0,
            team_id: 1,
        };
        let frame = frame_of(payload.clone());
        assert_eq!(Packet::deserialize(&frame).unwrap().payload, payload);
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let mut frame = frame_of(Payload::Heartbeat).to_vec();
        frame[0] = 99;
        assert_eq!(Packet::deserialize(&frame), Err(PacketError::UnknownType(99)));
    }

    #[test]
    fn short_frame_is_rejected() {
        let frame = frame_of(Payload::Heartbeat);
        assert!(matches!(
            Packet::deserialize(&frame[..PACKET_SIZE - 1]),
            Err(PacketError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_string_length_is_rejected() {
        let mut frame = frame_of(Payload::WorldInfo {
            filename: "arena_01.map".into(),
        })
        .to_vec();
        // Claim a filename longer than the codec allows.
        frame[25] = (MAX_FILENAME_LEN + 1) as u8;
        assert_eq!(
            Packet::deserialize(&frame),
            Err(PacketError::StringTooLong {
                field: "filename",
                max: MAX_FILENAME_LEN
            })
        );
    }

    #[test]
    fn invalid_utf8_in_string_is_rejected() {
        let mut frame = frame_of(Payload::WorldInfo {
            filename: "arena_01.map".into(),
        })
        .to_vec();
        // Stomp the first filename byte with a lone continuation byte.
        frame[26] = 0xFF;
        assert_eq!(
            Packet::deserialize(&frame),
            Err(PacketError::InvalidUtf8 { field: "filename" })
        );
    }

    #[test]
    fn reliable_and_unreliable_serialize_identically_sized() {
        let reliable = frame_of(Payload::PlayerLeave);
        let unreliable = frame_of(Payload::Heartbeat);
        assert_eq!(reliable.len(), unreliable.len());
    }
}
