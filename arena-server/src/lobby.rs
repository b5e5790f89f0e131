//! The lobby manager: the global table of rooms waiting to become matches.
//! All mutations run under one async mutex, which also serializes game
//! start so a double START cannot spawn two instances. The manager is pure
//! bookkeeping; the server core turns its outcome values into packets.

use crate::clock::now_ms;
use crate::world;
use protocol::{GameMode, LobbyStatus, Payload, PlayerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Duration clamp bounds, minutes.
const MIN_DURATION_MIN: u8 = 1;
const MAX_DURATION_MIN: u8 = 30;
/// Smallest useful lobby.
const MIN_PLAYERS: u8 = 2;

/// One room. Bots count as members; the ordered member list decides team
/// assignment at start.
#[derive(Debug, Clone)]
pub struct Lobby {
    pub id: u32,
    pub host: PlayerId,
    pub name: String,
    pub map_index: u8,
    pub duration_min: u8,
    pub max_players: u8,
    pub members: Vec<PlayerId>,
    pub characters: HashMap<PlayerId, u8>,
    pub status: LobbyStatus,
    pub game_mode: GameMode,
    pub team_size: u8,
    pub ranked: bool,
}

impl Lobby {
    pub fn player_count(&self) -> u8 {
        self.members.len() as u8
    }

    pub fn human_count(&self) -> usize {
        self.members.iter().filter(|m| !m.is_bot()).count()
    }

    pub fn contains(&self, id: PlayerId) -> bool {
        self.members.contains(&id)
    }

    /// The LIST_ENTRY / JOINED payload describing this lobby.
    pub fn describe(&self, action: protocol::LobbyCommand) -> Payload {
        Payload::LobbyAction {
            action,
            lobby: self.id,
            map_index: self.map_index,
            duration_min: self.duration_min,
            max_players: self.max_players,
            player_count: self.player_count(),
            status: self.status,
            name: self.name.clone(),
            character_id: 0,
            game_mode: self.game_mode,
            team_size: self.team_size,
        }
    }
}

/// Everything the core needs to spin up the instance for a starting lobby.
#[derive(Debug, Clone)]
pub struct StartPlan {
    pub lobby_id: u32,
    pub map_index: u8,
    pub duration_min: u8,
    pub game_mode: GameMode,
    pub team_size: u8,
    pub ranked: bool,
    /// Roster order as in the lobby, with the selected character per
    /// member. Team ids alternate over this order in Teams mode.
    pub roster: Vec<(PlayerId, u8)>,
}

/// Why a lobby operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyError {
    BadName,
    UnknownMap,
    CreateCooldown,
    AlreadyInLobby,
    UnknownLobby,
    NotWaiting,
    Full,
    NotHost,
    NoHumans,
    NotInLobby,
    UnknownCharacter,
}

/// Outcome of a leave: whom to notify about what.
#[derive(Debug)]
pub enum LeaveOutcome {
    /// The host left; the lobby is gone. Notify the listed members.
    Closed { lobby_id: u32, members: Vec<PlayerId> },
    /// A regular member left. Notify the listed remaining members.
    Left { lobby_id: u32, members: Vec<PlayerId> },
    NotInLobby,
}

#[derive(Default)]
struct LobbyTable {
    lobbies: HashMap<u32, Lobby>,
    by_player: HashMap<PlayerId, u32>,
    next_id: u32,
    host_cooldown: HashMap<PlayerId, u64>,
}

pub struct LobbyManager {
    table: Mutex<LobbyTable>,
    /// Monotonic bot ids; the low 64 bit range is reserved for bots.
    bot_counter: AtomicU64,
    create_cooldown_ms: u64,
    max_players_cap: u8,
}

impl LobbyManager {
    pub fn new(create_cooldown_ms: u64, max_players_cap: u8) -> LobbyManager {
        LobbyManager {
            table: Mutex::new(LobbyTable::default()),
            bot_counter: AtomicU64::new(1),
            create_cooldown_ms,
            max_players_cap,
        }
    }

    /// Strips control, directional and zero-width characters, then trims.
    /// Returns None when nothing printable remains.
    pub fn sanitize_name(raw: &str) -> Option<String> {
        let cleaned: String = raw
            .chars()
            .filter(|c| {
                !c.is_control()
                    && !matches!(
                        c,
                        '\u{200B}'..='\u{200F}'
                            | '\u{202A}'..='\u{202E}'
                            | '\u{2066}'..='\u{2069}'
                            | '\u{061C}'
                            | '\u{FEFF}'
                    )
            })
            .collect();
        let trimmed = cleaned.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.chars().take(protocol::MAX_NAME_LEN).collect())
        }
    }

    /// Creates a lobby with the caller as host and sole member.
    pub async fn create(
        &self,
        host: PlayerId,
        raw_name: &str,
        map_index: u8,
        duration_min: u8,
        max_players: u8,
    ) -> Result<Lobby, LobbyError> {
        let name = Self::sanitize_name(raw_name).ok_or(LobbyError::BadName)?;
        if !world::is_valid_map(map_index) {
            return Err(LobbyError::UnknownMap);
        }
        let duration_min = duration_min.clamp(MIN_DURATION_MIN, MAX_DURATION_MIN);
        let max_players = max_players.clamp(MIN_PLAYERS, self.max_players_cap);
        let now = now_ms();

        let mut table = self.table.lock().await;
        if table.by_player.contains_key(&host) {
            return Err(LobbyError::AlreadyInLobby);
        }
        if let Some(last) = table.host_cooldown.get(&host)
            && now.saturating_sub(*last) < self.create_cooldown_ms
        {
            return Err(LobbyError::CreateCooldown);
        }
        table.next_id += 1;
        let id = table.next_id;
        let lobby = Lobby {
            id,
            host,
            name,
            map_index,
            duration_min,
            max_players,
            members: vec![host],
            characters: HashMap::from([(host, 0)]),
            status: LobbyStatus::Waiting,
            game_mode: GameMode::Ffa,
            team_size: 1,
            ranked: false,
        };
        table.host_cooldown.insert(host, now);
        table.by_player.insert(host, id);
        table.lobbies.insert(id, lobby.clone());
        Ok(lobby)
    }

    /// Adds a player to a waiting lobby. Returns the lobby snapshot for
    /// the JOINED reply and the members to notify.
    pub async fn join(&self, player: PlayerId, lobby_id: u32) -> Result<Lobby, LobbyError> {
        let mut table = self.table.lock().await;
        if table.by_player.contains_key(&player) {
            return Err(LobbyError::AlreadyInLobby);
        }
        let lobby = table
            .lobbies
            .get_mut(&lobby_id)
            .ok_or(LobbyError::UnknownLobby)?;
        if lobby.status != LobbyStatus::Waiting {
            return Err(LobbyError::NotWaiting);
        }
        if lobby.player_count() >= lobby.max_players {
            return Err(LobbyError::Full);
        }
        lobby.members.push(player);
        lobby.characters.insert(player, 0);
        let snapshot = lobby.clone();
        table.by_player.insert(player, lobby_id);
        Ok(snapshot)
    }

    /// Removes a player from their lobby; a leaving host closes it.
    pub async fn leave(&self, player: PlayerId) -> LeaveOutcome {
        let mut table = self.table.lock().await;
        let Some(lobby_id) = table.by_player.remove(&player) else {
            return LeaveOutcome::NotInLobby;
        };
        let Some(lobby) = table.lobbies.get_mut(&lobby_id) else {
            return LeaveOutcome::NotInLobby;
        };
        if lobby.host == player {
            let members: Vec<PlayerId> = lobby
                .members
                .iter()
                .copied()
                .filter(|m| *m != player && !m.is_bot())
                .collect();
            table.lobbies.remove(&lobby_id);
            for member in &members {
                table.by_player.remove(member);
            }
            LeaveOutcome::Closed { lobby_id, members }
        } else {
            lobby.members.retain(|m| *m != player);
            lobby.characters.remove(&player);
            let members: Vec<PlayerId> = lobby
                .members
                .iter()
                .copied()
                .filter(|m| !m.is_bot())
                .collect();
            LeaveOutcome::Left { lobby_id, members }
        }
    }

    /// Host-only configuration change on a waiting lobby. In Teams mode
    /// the player ceiling is pinned to `2 * team_size` and surplus bots
    /// are evicted (returned for PLAYER_LEFT notifications).
    pub async fn update_config(
        &self,
        caller: PlayerId,
        lobby_id: u32,
        map_index: u8,
        duration_min: u8,
        max_players: u8,
        game_mode: GameMode,
        team_size: u8,
    ) -> Result<(Lobby, Vec<PlayerId>), LobbyError> {
        if !world::is_valid_map(map_index) {
            return Err(LobbyError::UnknownMap);
        }
        let mut table = self.table.lock().await;
        let lobby = table
            .lobbies
            .get_mut(&lobby_id)
            .ok_or(LobbyError::UnknownLobby)?;
        if lobby.host != caller {
            return Err(LobbyError::NotHost);
        }
        if lobby.status != LobbyStatus::Waiting {
            return Err(LobbyError::NotWaiting);
        }
        lobby.map_index = map_index;
        lobby.duration_min = duration_min.clamp(MIN_DURATION_MIN, MAX_DURATION_MIN);
        lobby.game_mode = game_mode;
        lobby.team_size = team_size.max(1);
        lobby.max_players = match game_mode {
            GameMode::Teams => (2 * lobby.team_size).clamp(MIN_PLAYERS, self.max_players_cap),
            GameMode::Ffa => max_players.clamp(MIN_PLAYERS, self.max_players_cap),
        };

        let mut evicted = Vec::new();
        while lobby.player_count() > lobby.max_players {
            let Some(pos) = lobby.members.iter().rposition(|m| m.is_bot()) else {
                break;
            };
            let bot = lobby.members.remove(pos);
            lobby.characters.remove(&bot);
            evicted.push(bot);
        }
        Ok((lobby.clone(), evicted))
    }

    /// Member character selection.
    pub async fn select_character(
        &self,
        player: PlayerId,
        character_id: u8,
    ) -> Result<u32, LobbyError> {
        if character_id >= crate::characters::character_count() {
            return Err(LobbyError::UnknownCharacter);
        }
        let mut table = self.table.lock().await;
        let Some(lobby_id) = table.by_player.get(&player).copied() else {
            return Err(LobbyError::NotInLobby);
        };
        let lobby = table
            .lobbies
            .get_mut(&lobby_id)
            .ok_or(LobbyError::UnknownLobby)?;
        lobby.characters.insert(player, character_id);
        Ok(lobby_id)
    }

    /// Host adds one bot. Returns the fresh bot identity and the lobby
    /// snapshot.
    pub async fn add_bot(&self, caller: PlayerId) -> Result<(PlayerId, Lobby), LobbyError> {
        let mut table = self.table.lock().await;
        let Some(lobby_id) = table.by_player.get(&caller).copied() else {
            return Err(LobbyError::NotInLobby);
        };
        let lobby = table
            .lobbies
            .get_mut(&lobby_id)
            .ok_or(LobbyError::UnknownLobby)?;
        if lobby.host != caller {
            return Err(LobbyError::NotHost);
        }
        if lobby.status != LobbyStatus::Waiting {
            return Err(LobbyError::NotWaiting);
        }
        if lobby.player_count() >= lobby.max_players {
            return Err(LobbyError::Full);
        }
        let bot = PlayerId::bot(self.bot_counter.fetch_add(1, Ordering::AcqRel));
        let character = (bot.0 as u8) % crate::characters::character_count();
        lobby.members.push(bot);
        lobby.characters.insert(bot, character);
        Ok((bot, lobby.clone()))
    }

    /// Host removes the newest bot.
    pub async fn remove_bot(&self, caller: PlayerId) -> Result<(PlayerId, Lobby), LobbyError> {
        let mut table = self.table.lock().await;
        let Some(lobby_id) = table.by_player.get(&caller).copied() else {
            return Err(LobbyError::NotInLobby);
        };
        let lobby = table
            .lobbies
            .get_mut(&lobby_id)
            .ok_or(LobbyError::UnknownLobby)?;
        if lobby.host != caller {
            return Err(LobbyError::NotHost);
        }
        let Some(pos) = lobby.members.iter().rposition(|m| m.is_bot()) else {
            return Err(LobbyError::NotInLobby);
        };
        let bot = lobby.members.remove(pos);
        lobby.characters.remove(&bot);
        Ok((bot, lobby.clone()))
    }

    /// Every lobby, for LIST responses.
    pub async fn list(&self) -> Vec<Lobby> {
        let table = self.table.lock().await;
        let mut lobbies: Vec<Lobby> = table.lobbies.values().cloned().collect();
        lobbies.sort_by_key(|l| l.id);
        lobbies
    }

    pub async fn lobby_of(&self, player: PlayerId) -> Option<Lobby> {
        let table = self.table.lock().await;
        let id = table.by_player.get(&player)?;
        table.lobbies.get(id).cloned()
    }

    /// Host-only start. The Waiting→InGame transition happens under the
    /// table lock, so a second START is a no-op.
    pub async fn start(&self, caller: PlayerId) -> Result<StartPlan, LobbyError> {
        let mut table = self.table.lock().await;
        let Some(lobby_id) = table.by_player.get(&caller).copied() else {
            return Err(LobbyError::NotInLobby);
        };
        let lobby = table
            .lobbies
            .get_mut(&lobby_id)
            .ok_or(LobbyError::UnknownLobby)?;
        if lobby.host != caller {
            return Err(LobbyError::NotHost);
        }
        if lobby.status != LobbyStatus::Waiting {
            return Err(LobbyError::NotWaiting);
        }
        if lobby.human_count() == 0 {
            return Err(LobbyError::NoHumans);
        }
        lobby.status = LobbyStatus::InGame;
        Ok(Self::plan_from(lobby))
    }

    /// Builds a ranked, already-running lobby for a formed match. Bots are
    /// appended to fill the roster to `fill_to`.
    pub async fn create_ranked(
        &self,
        members: &[(PlayerId, u8)],
        map_index: u8,
        duration_min: u8,
        fill_to: u8,
    ) -> StartPlan {
        let mut table = self.table.lock().await;
        table.next_id += 1;
        let id = table.next_id;
        let mut lobby = Lobby {
            id,
            host: members.first().map(|(id, _)| *id).unwrap_or(PlayerId::ZERO),
            name: format!("ranked {id}"),
            map_index,
            duration_min,
            max_players: fill_to.max(members.len() as u8),
            members: members.iter().map(|(id, _)| *id).collect(),
            characters: members.iter().copied().collect(),
            status: LobbyStatus::InGame,
            game_mode: GameMode::Ffa,
            team_size: 1,
            ranked: true,
        };
        while lobby.player_count() < fill_to {
            let bot = PlayerId::bot(self.bot_counter.fetch_add(1, Ordering::AcqRel));
            let character = (bot.0 as u8) % crate::characters::character_count();
            lobby.members.push(bot);
            lobby.characters.insert(bot, character);
        }
        for (member, _) in members {
            table.by_player.insert(*member, id);
        }
        let plan = Self::plan_from(&lobby);
        table.lobbies.insert(id, lobby);
        plan
    }

    fn plan_from(lobby: &Lobby) -> StartPlan {
        StartPlan {
            lobby_id: lobby.id,
            map_index: lobby.map_index,
            duration_min: lobby.duration_min,
            game_mode: lobby.game_mode,
            team_size: lobby.team_size,
            ranked: lobby.ranked,
            roster: lobby
                .members
                .iter()
                .map(|m| (*m, lobby.characters.get(m).copied().unwrap_or(0)))
                .collect(),
        }
    }

    /// Tears the lobby down after its match ended, freeing every member
    /// for new lobbies.
    pub async fn finish(&self, lobby_id: u32) -> Vec<PlayerId> {
        let mut table = self.table.lock().await;
        let Some(mut lobby) = table.lobbies.remove(&lobby_id) else {
            return Vec::new();
        };
        lobby.status = LobbyStatus::Finished;
        for member in &lobby.members {
            table.by_player.remove(member);
        }
        lobby.members.iter().copied().filter(|m| !m.is_bot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u128) -> PlayerId {
        PlayerId(n | 1 << 64)
    }

    fn manager() -> LobbyManager {
        LobbyManager::new(5_000, 8)
    }

    #[test]
    fn name_sanitizer_strips_direction_tricks() {
        assert_eq!(
            LobbyManager::sanitize_name("  my\u{202E}lobby\u{200B}  ").as_deref(),
            Some("mylobby")
        );
        assert_eq!(LobbyManager::sanitize_name("\u{202A}\u{200D}  "), None);
        assert_eq!(LobbyManager::sanitize_name("ok name").as_deref(), Some("ok name"));
    }

    #[tokio::test]
    async fn create_clamps_and_enforces_cooldown() {
        let manager = manager();
        let lobby = manager.create(id(1), "room", 0, 99, 99).await.unwrap();
        assert_eq!(lobby.duration_min, 30);
        assert_eq!(lobby.max_players, 8);
        // Second create while still in the lobby is refused outright.
        assert_eq!(
            manager.create(id(1), "again", 0, 5, 4).await.err(),
            Some(LobbyError::AlreadyInLobby)
        );
        // After leaving, the cooldown still blocks.
        manager.leave(id(1)).await;
        assert_eq!(
            manager.create(id(1), "again", 0, 5, 4).await.err(),
            Some(LobbyError::CreateCooldown)
        );
    }

    #[tokio::test]
    async fn host_leave_closes_and_frees_members() {
        let manager = manager();
        let lobby = manager.create(id(1), "room", 0, 5, 4).await.unwrap();
        manager.join(id(2), lobby.id).await.unwrap();
        let outcome = manager.leave(id(1)).await;
        let LeaveOutcome::Closed { lobby_id, members } = outcome else {
            panic!("host leave must close the lobby");
        };
        assert_eq!(lobby_id, lobby.id);
        assert_eq!(members, vec![id(2)]);
        assert!(manager.list().await.is_empty());
        // Former member can open a new lobby right away.
        assert!(manager.create(id(2), "fresh", 0, 5, 4).await.is_ok());
    }

    #[tokio::test]
    async fn teams_mode_pins_capacity_and_evicts_bots() {
        let manager = manager();
        let lobby = manager.create(id(1), "room", 0, 5, 8).await.unwrap();
        for _ in 0..5 {
            manager.add_bot(id(1)).await.unwrap();
        }
        let (updated, evicted) = manager
            .update_config(id(1), lobby.id, 0, 5, 8, GameMode::Teams, 2)
            .await
            .unwrap();
        assert_eq!(updated.max_players, 4);
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|e| e.is_bot()));
    }

    #[tokio::test]
    async fn start_is_host_only_and_single_shot() {
        let manager = manager();
        let lobby = manager.create(id(1), "room", 0, 5, 4).await.unwrap();
        manager.join(id(2), lobby.id).await.unwrap();
        assert_eq!(manager.start(id(2)).await.err(), Some(LobbyError::NotHost));
        let plan = manager.start(id(1)).await.unwrap();
        assert_eq!(plan.roster.len(), 2);
        assert_eq!(manager.start(id(1)).await.err(), Some(LobbyError::NotWaiting));
        // Nobody can join a running lobby.
        assert_eq!(
            manager.join(id(3), lobby.id).await.err(),
            Some(LobbyError::NotWaiting)
        );
    }

    #[tokio::test]
    async fn ranked_lobby_fills_with_bots() {
        let manager = manager();
        let plan = manager
            .create_ranked(&[(id(1), 0), (id(2), 2)], 1, 5, 6)
            .await;
        assert!(plan.ranked);
        assert_eq!(plan.roster.len(), 6);
        let bots = plan.roster.iter().filter(|(m, _)| m.is_bot()).count();
        assert_eq!(bots, 4);
        // The humans are bound to the lobby and cannot join another.
        assert_eq!(
            manager.join(id(1), plan.lobby_id).await.err(),
            Some(LobbyError::AlreadyInLobby)
        );
    }

    #[tokio::test]
    async fn finish_frees_everyone() {
        let manager = manager();
        let lobby = manager.create(id(1), "room", 0, 5, 4).await.unwrap();
        manager.join(id(2), lobby.id).await.unwrap();
        manager.start(id(1)).await.unwrap();
        let notified = manager.finish(lobby.id).await;
        assert_eq!(notified.len(), 2);
        assert!(manager.lobby_of(id(2)).await.is_none());
        assert!(manager.list().await.is_empty());
    }
}
