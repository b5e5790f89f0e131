//! The wire protocol shared between the arena server and its clients.
//! Every packet travels in a fixed-size frame; each packet type is pinned to
//! either the reliable stream or the unreliable datagram channel, and the
//! codec in [`packet`] enforces the layout in both directions.

pub mod packet;

pub use packet::{Packet, PacketError, Payload};

/// The size of every serialized packet frame in bytes. Payloads are
/// zero-padded up to this size.
pub const PACKET_SIZE: usize = 512;

/// Header bytes preceding the payload: type tag (1), sequence number (4),
/// sender identity (16), timestamp (4).
pub const HEADER_SIZE: usize = 25;

/// Reliable stream frames carry a big-endian length prefix of this size.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// The default port the server binds for both the TCP and UDP endpoint.
pub const SERVER_PORT: u16 = 4744;

/// Upper bound for user names on the wire.
pub const MAX_NAME_LEN: usize = 32;
/// Upper bound for passwords on the wire.
pub const MAX_PASSWORD_LEN: usize = 64;
/// Upper bound for free-text messages (auth responses).
pub const MAX_MESSAGE_LEN: usize = 128;
/// Upper bound for world filenames.
pub const MAX_FILENAME_LEN: usize = 64;

// Status-effect flags carried in PLAYER_UPDATE packets.

/// Player currently holds a shield.
pub const EFFECT_SHIELD: u8 = 0x01;
/// Player has an active gem boost.
pub const EFFECT_GEM: u8 = 0x02;
/// Player is frozen in place.
pub const EFFECT_FROZEN: u8 = 0x04;
/// Player is phased and can pass through solid tiles.
pub const EFFECT_PHASED: u8 = 0x08;
/// Player is burning.
pub const EFFECT_BURNING: u8 = 0x10;
/// Player has a speed boost.
pub const EFFECT_SPEED: u8 = 0x20;
/// Player is rooted (cannot move, can act).
pub const EFFECT_ROOTED: u8 = 0x40;
/// Player is slowed.
pub const EFFECT_SLOWED: u8 = 0x80;

/// The 128 bit identity of a player. Real accounts derive this
/// deterministically from the user name; bots occupy the reserved range
/// where the upper 64 bits are zero and the lower 64 bits are non-zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u128);

impl PlayerId {
    /// The all-zero identity, used as "no sender" / "no target".
    pub const ZERO: PlayerId = PlayerId(0);

    /// Builds the identity of the n-th bot. `n` must be non-zero.
    pub fn bot(n: u64) -> PlayerId {
        debug_assert!(n != 0, "bot ids start at 1");
        PlayerId(n as u128)
    }

    /// True for identities in the reserved bot range.
    pub fn is_bot(self) -> bool {
        self.0 != 0 && (self.0 >> 64) == 0
    }

    /// True for the all-zero identity.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl std::fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlayerId({:032x})", self.0)
    }
}

/// An RGB display color chosen by the client.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Color {
        Color { r, g, b }
    }
}

/// The channel a packet type travels on. The assignment is fixed: a reliable
/// type is never sent as a datagram and vice versa.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Transport {
    Reliable,
    Unreliable,
}

/// All packet type tags on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PacketType {
    AuthRequest = 1,
    AuthResponse = 2,
    PlayerJoin = 3,
    PlayerLeave = 4,
    PlayerUpdate = 5,
    Heartbeat = 6,
    ProjectileUpdate = 7,
    ItemUpdate = 8,
    TileUpdate = 9,
    WorldInfo = 10,
    LobbyAction = 11,
    GameEvent = 12,
    RankedQueue = 13,
    MatchHistory = 14,
    Leaderboard = 15,
}

impl PacketType {
    /// The transport channel this packet type is pinned to.
    pub fn transport(self) -> Transport {
        match self {
            PacketType::PlayerUpdate | PacketType::Heartbeat | PacketType::ProjectileUpdate => {
                Transport::Unreliable
            }
            _ => Transport::Reliable,
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<PacketType, u8> {
        Ok(match tag {
            1 => PacketType::AuthRequest,
            2 => PacketType::AuthResponse,
            3 => PacketType::PlayerJoin,
            4 => PacketType::PlayerLeave,
            5 => PacketType::PlayerUpdate,
            6 => PacketType::Heartbeat,
            7 => PacketType::ProjectileUpdate,
            8 => PacketType::ItemUpdate,
            9 => PacketType::TileUpdate,
            10 => PacketType::WorldInfo,
            11 => PacketType::LobbyAction,
            12 => PacketType::GameEvent,
            13 => PacketType::RankedQueue,
            14 => PacketType::MatchHistory,
            15 => PacketType::Leaderboard,
            other => return Err(other),
        })
    }
}

/// Sub-action of an AUTH_REQUEST.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum AuthAction {
    Login = 0,
    Register = 1,
}

/// Sub-action of a PROJECTILE_UPDATE.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ProjectileAction {
    Spawn = 0,
    Move = 1,
    Hit = 2,
    Despawn = 3,
}

/// Sub-action of an ITEM_UPDATE.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ItemAction {
    Spawn = 0,
    Pickup = 1,
    Inventory = 2,
    Use = 3,
}

/// The item kinds that can spawn in a world.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ItemKind {
    Heart = 0,
    Shield = 1,
    Gem = 2,
    Star = 3,
    Fence = 4,
}

/// Sub-action of a LOBBY_ACTION.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LobbyCommand {
    ListRequest = 0,
    ListEntry = 1,
    ListEnd = 2,
    Create = 3,
    Join = 4,
    Joined = 5,
    Leave = 6,
    PlayerJoined = 7,
    PlayerLeft = 8,
    Start = 9,
    GameStarting = 10,
    ConfigUpdate = 11,
    CharacterSelect = 12,
    LobbyClosed = 13,
    AddBot = 14,
    RemoveBot = 15,
}

/// Lifecycle status of a lobby.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum LobbyStatus {
    Waiting = 0,
    InGame = 1,
    Finished = 2,
}

/// The mode a match is played in.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
#[repr(u8)]
pub enum GameMode {
    #[default]
    Ffa = 0,
    Teams = 1,
}

/// Sub-event of a GAME_EVENT.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GameEventKind {
    Kill = 0,
    TimeSync = 1,
    GameOver = 2,
    ScoreEntry = 3,
    ScoreEnd = 4,
    Respawn = 5,
}

/// Sub-action of a RANKED_QUEUE packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum QueueAction {
    Join = 0,
    Leave = 1,
    CharacterChange = 2,
    Status = 3,
    MatchFound = 4,
}

/// Sub-action of a MATCH_HISTORY packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum HistoryAction {
    Query = 0,
    Stats = 1,
    Entry = 2,
    End = 3,
}

/// Sub-action of a LEADERBOARD packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum BoardAction {
    Query = 0,
    Entry = 1,
    End = 2,
}

macro_rules! impl_try_from_u8 {
    ($($name:ident { $($variant:ident = $value:literal),* $(,)? })*) => {
        $(impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(value: u8) -> Result<$name, u8> {
                Ok(match value {
                    $($value => $name::$variant,)*
                    other => return Err(other),
                })
            }
        })*
    };
}

impl_try_from_u8! {
    AuthAction { Login = 0, Register = 1 }
    ProjectileAction { Spawn = 0, Move = 1, Hit = 2, Despawn = 3 }
    ItemAction { Spawn = 0, Pickup = 1, Inventory = 2, Use = 3 }
    ItemKind { Heart = 0, Shield = 1, Gem = 2, Star = 3, Fence = 4 }
    LobbyCommand {
        ListRequest = 0, ListEntry = 1, ListEnd = 2, Create = 3, Join = 4,
        Joined = 5, Leave = 6, PlayerJoined = 7, PlayerLeft = 8, Start = 9,
        GameStarting = 10, ConfigUpdate = 11, CharacterSelect = 12,
        LobbyClosed = 13, AddBot = 14, RemoveBot = 15,
    }
    LobbyStatus { Waiting = 0, InGame = 1, Finished = 2 }
    GameMode { Ffa = 0, Teams = 1 }
    GameEventKind { Kill = 0, TimeSync = 1, GameOver = 2, ScoreEntry = 3, ScoreEnd = 4, Respawn = 5 }
    QueueAction { Join = 0, Leave = 1, CharacterChange = 2, Status = 3, MatchFound = 4 }
    HistoryAction { Query = 0, Stats = 1, Entry = 2, End = 3 }
    BoardAction { Query = 0, Entry = 1, End = 2 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_range_is_disjoint_from_accounts() {
        let bot = PlayerId::bot(17);
        assert!(bot.is_bot());
        assert!(!PlayerId::ZERO.is_bot());
        // Anything with high bits set is an account identity.
        let account = PlayerId(1u128 << 64 | 42);
        assert!(!account.is_bot());
    }

    #[test]
    fn unreliable_types_are_exactly_the_hot_path() {
        for tag in 1..=15u8 {
            let ty = PacketType::try_from(tag).unwrap();
            let expect = matches!(
                ty,
                PacketType::PlayerUpdate | PacketType::Heartbeat | PacketType::ProjectileUpdate
            );
            assert_eq!(ty.transport() == Transport::Unreliable, expect, "{ty:?}");
        }
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert!(PacketType::try_from(0).is_err());
        assert!(PacketType::try_from(16).is_err());
        assert!(LobbyCommand::try_from(16).is_err());
        assert!(GameEventKind::try_from(6).is_err());
    }

    #[test]
    fn effect_flags_cover_the_full_byte() {
        let all = EFFECT_SHIELD
            | EFFECT_GEM
            | EFFECT_FROZEN
            | EFFECT_PHASED
            | EFFECT_BURNING
            | EFFECT_SPEED
            | EFFECT_ROOTED
            | EFFECT_SLOWED;
        assert_eq!(all, 0xFF);
    }
}
