//! The server core: the top-level coordinator. Owns the credential store,
//! the rate limiter, the lobby manager, the matchmaker, the global player
//! registry and every running game instance, and routes each decoded packet
//! to the right subsystem.
//!
//! Routing rules: authentication packets are the only thing an unbound
//! connection may send; everything else must carry the identity bound to
//! its channel, and in-match traffic is forwarded to the instance of the
//! sender's lobby.

use crate::clock::now_ms;
use crate::config::ServerConfig;
use crate::game::registry::{PlayerRegistry, PlayerState};
use crate::game::{GameInstance, InstanceSettings};
use crate::lobby::{LeaveOutcome, LobbyError, LobbyManager, StartPlan};
use crate::matchmaker::Matchmaker;
use crate::net::rate_limit::RateLimiter;
use crate::net::{ClientHandle, Outbound};
use crate::store::{self, CredentialStore};
use crate::world;
use protocol::{
    AuthAction, BoardAction, Color, GameMode, HistoryAction, LobbyCommand, LobbyStatus, Packet,
    Payload, PlayerId, QueueAction,
};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Ranked matches always run on these settings.
const RANKED_MAP_INDEX: u8 = 0;
const RANKED_DURATION_MIN: u8 = 5;

/// Palette assigned to participants by roster position; clients may paint
/// themselves later via PLAYER_UPDATE, the server just needs distinct
/// defaults.
const PALETTE: &[Color] = &[
    Color::new(230, 80, 60),
    Color::new(60, 140, 230),
    Color::new(70, 200, 120),
    Color::new(240, 200, 70),
    Color::new(190, 90, 220),
    Color::new(90, 220, 220),
    Color::new(240, 140, 70),
    Color::new(160, 160, 160),
];

struct ConnEntry {
    handle: ClientHandle,
    player: Option<PlayerId>,
}

pub struct ServerCore {
    pub config: Arc<ServerConfig>,
    pub store: Arc<CredentialStore>,
    pub limiter: RateLimiter,
    pub lobbies: LobbyManager,
    pub matchmaker: Matchmaker,
    /// Everyone authenticated on this server, in or out of a match.
    pub global: PlayerRegistry,
    pub outbound: Arc<Outbound>,
    instances: RwLock<HashMap<u32, Arc<GameInstance>>>,
    conns: RwLock<HashMap<u64, ConnEntry>>,
    finished_tx: mpsc::Sender<u32>,
    finished_rx: tokio::sync::Mutex<Option<mpsc::Receiver<u32>>>,
}

impl ServerCore {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<CredentialStore>,
        outbound: Arc<Outbound>,
    ) -> Arc<ServerCore> {
        let (finished_tx, finished_rx) = mpsc::channel(16);
        Arc::new(ServerCore {
            lobbies: LobbyManager::new(config.lobby_create_cooldown_ms, config.max_lobby_players),
            matchmaker: Matchmaker::new(),
            limiter: RateLimiter::new(),
            global: PlayerRegistry::new(),
            instances: RwLock::new(HashMap::new()),
            conns: RwLock::new(HashMap::new()),
            finished_tx,
            finished_rx: tokio::sync::Mutex::new(Some(finished_rx)),
            config,
            store,
            outbound,
        })
    }

    /// Launches the periodic machinery: matchmaking, rate-limiter sweeps,
    /// heartbeat expiry and the finished-instance listener.
    pub async fn start_background(self: &Arc<ServerCore>) {
        let core = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(
                core.config.matchmaking_tick_s,
            ));
            loop {
                interval.tick().await;
                core.matchmaking_tick().await;
            }
        });

        let core = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
            loop {
                interval.tick().await;
                core.limiter.cleanup(now_ms());
            }
        });

        let core = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
                core.config.heartbeat_interval_ms,
            ));
            loop {
                interval.tick().await;
                core.timeout_sweep().await;
            }
        });

        let mut finished_rx = self
            .finished_rx
            .lock()
            .await
            .take()
            .expect("background tasks started twice");
        let core = self.clone();
        tokio::spawn(async move {
            while let Some(lobby_id) = finished_rx.recv().await {
                core.lobbies.finish(lobby_id).await;
                core.instances
                    .write()
                    .expect("instance table poisoned")
                    .remove(&lobby_id);
                tracing::info!(lobby = lobby_id, "Instance deregistered.");
            }
        });
    }

    // ---- connection bookkeeping ----------------------------------------

    pub fn register_conn(&self, handle: ClientHandle) {
        self.conns.write().expect("conn table poisoned").insert(
            handle.conn_id,
            ConnEntry {
                handle,
                player: None,
            },
        );
    }

    fn conn_handle(&self, conn_id: u64) -> Option<ClientHandle> {
        self.conns
            .read()
            .expect("conn table poisoned")
            .get(&conn_id)
            .map(|entry| entry.handle.clone())
    }

    fn conn_player(&self, conn_id: u64) -> Option<PlayerId> {
        self.conns
            .read()
            .expect("conn table poisoned")
            .get(&conn_id)
            .and_then(|entry| entry.player)
    }

    fn bind_conn(&self, conn_id: u64, player: PlayerId) {
        if let Some(entry) = self
            .conns
            .write()
            .expect("conn table poisoned")
            .get_mut(&conn_id)
        {
            entry.player = Some(player);
        }
    }

    /// Reliable channel went away: run the full departure cascade unless
    /// the player already rebound to a newer connection.
    pub async fn on_disconnect(&self, conn_id: u64) {
        let player = {
            let mut conns = self.conns.write().expect("conn table poisoned");
            conns.remove(&conn_id).and_then(|entry| entry.player)
        };
        self.limiter.forget_conn(conn_id);
        let Some(player) = player else {
            return;
        };
        if let Some(state) = self.global.get(player)
            && state.reliable_conn() != Some(conn_id)
        {
            // Rebound elsewhere in the meantime; this socket is stale.
            return;
        }
        self.drop_player(player).await;
    }

    /// Removes a player from the queue, their lobby (closing it when they
    /// host) and their instance, then from the global registry.
    async fn drop_player(&self, player: PlayerId) {
        self.matchmaker.leave(player).await;

        if let Some(instance) = self.instance_of(player).await {
            instance.remove_player(player).await;
        }
        match self.lobbies.leave(player).await {
            LeaveOutcome::Closed { lobby_id, members } => {
                self.notify_lobby_closed(lobby_id, &members).await;
                if let Some(instance) = self.instance(lobby_id) {
                    instance.end_game();
                }
            }
            LeaveOutcome::Left { lobby_id, members } => {
                self.notify_members(
                    &members,
                    player,
                    lobby_action_simple(LobbyCommand::PlayerLeft, lobby_id),
                )
                .await;
            }
            LeaveOutcome::NotInLobby => {}
        }
        self.global.remove(player);
        tracing::info!(player = %player, "Player disconnected.");
    }

    async fn notify_lobby_closed(&self, lobby_id: u32, members: &[PlayerId]) {
        self.notify_members(
            members,
            PlayerId::ZERO,
            lobby_action_simple(LobbyCommand::LobbyClosed, lobby_id),
        )
        .await;
    }

    /// Sends one payload to each listed identity over its global binding.
    async fn notify_members(&self, members: &[PlayerId], sender: PlayerId, payload: Payload) {
        let states: Vec<Arc<PlayerState>> = members
            .iter()
            .filter_map(|m| self.global.get(*m))
            .collect();
        self.outbound.broadcast(&states, sender, payload).await;
    }

    fn instance(&self, lobby_id: u32) -> Option<Arc<GameInstance>> {
        self.instances
            .read()
            .expect("instance table poisoned")
            .get(&lobby_id)
            .cloned()
    }

    /// The running instance the player takes part in, if any.
    async fn instance_of(&self, player: PlayerId) -> Option<Arc<GameInstance>> {
        let lobby = self.lobbies.lobby_of(player).await?;
        if lobby.status != LobbyStatus::InGame {
            return None;
        }
        self.instance(lobby.id)
    }

    // ---- reliable path --------------------------------------------------

    pub async fn handle_reliable(&self, conn_id: u64, packet: Packet) {
        if let Payload::AuthRequest {
            action,
            username,
            password,
        } = &packet.payload
        {
            self.handle_auth(conn_id, *action, username, password).await;
            return;
        }

        let Some(bound) = self.conn_player(conn_id) else {
            if !self.limiter.allow_preauth(conn_id, now_ms()) {
                return;
            }
            tracing::debug!(conn = conn_id, "Non-auth packet before authentication.");
            return;
        };
        if bound != packet.sender {
            tracing::warn!(conn = conn_id, claimed = %packet.sender, bound = %bound, "Identity mismatch, packet dropped.");
            return;
        }
        if !self.limiter.allow_reliable(bound, now_ms()) {
            return;
        }
        let Some(state) = self.global.get(bound) else {
            return;
        };

        match packet.payload {
            Payload::LobbyAction { .. } => self.handle_lobby_action(&state, packet.payload).await,
            Payload::RankedQueue { action, character_id, .. } => {
                self.handle_queue(&state, action, character_id).await;
            }
            Payload::MatchHistory {
                action: HistoryAction::Query,
                ..
            } => {
                self.send_match_history(&state).await;
            }
            Payload::Leaderboard {
                action: BoardAction::Query,
                ..
            } => {
                self.send_leaderboard(&state).await;
            }
            Payload::PlayerJoin { x, y, .. } => {
                self.handle_global_join(&state, conn_id, (x as i32, y as i32))
                    .await;
            }
            _ => {
                // Everything else only makes sense inside a match.
                if let Some(instance) = self.instance_of(bound).await {
                    instance.handle_packet(packet).await;
                } else {
                    tracing::debug!(player = %bound, "In-game packet while not in a match.");
                }
            }
        }
    }

    async fn handle_auth(&self, conn_id: u64, action: AuthAction, username: &str, password: &str) {
        let Some(handle) = self.conn_handle(conn_id) else {
            return;
        };
        let now = now_ms();
        let ip = handle.addr.ip();
        if !self.limiter.auth_allowed(ip, now) || !self.limiter.allow_preauth(conn_id, now) {
            return;
        }
        if username.trim().is_empty() {
            self.auth_reply(&handle, false, PlayerId::ZERO, "empty username");
            return;
        }

        let verdict = match action {
            AuthAction::Login => self.store.authenticate(username, password).await,
            AuthAction::Register => self.store.register(username, password).await,
        };
        match verdict {
            Ok(true) => {
                let id = store::identifier_for(username);
                self.limiter.record_auth_success(ip);
                self.admit(conn_id, &handle, id, username).await;
                self.auth_reply(&handle, true, id, "ok");
                tracing::info!(player = %id, user = username, ?action, "Authentication succeeded.");
            }
            Ok(false) => {
                self.limiter.record_auth_failure(ip, now);
                let message = match action {
                    AuthAction::Login => "invalid credentials",
                    AuthAction::Register => "name already taken",
                };
                self.auth_reply(&handle, false, PlayerId::ZERO, message);
                tracing::info!(user = username, ?action, "Authentication failed.");
            }
            Err(err) => {
                tracing::error!(%err, "Credential store unavailable.");
                self.auth_reply(&handle, false, PlayerId::ZERO, "internal error");
            }
        }
    }

    fn auth_reply(&self, handle: &ClientHandle, success: bool, id: PlayerId, message: &str) {
        self.outbound.send_to_conn(
            handle,
            Payload::AuthResponse {
                success,
                assigned_id: id,
                message: message.to_string(),
            },
        );
    }

    /// Puts a fresh login into the global registry, rebinding when the
    /// identity is already connected.
    async fn admit(&self, conn_id: u64, handle: &ClientHandle, id: PlayerId, username: &str) {
        self.bind_conn(conn_id, id);
        if let Some(existing) = self.global.get(id) {
            existing.bind_reliable(handle.clone());
            existing.last_heartbeat.store(now_ms(), Ordering::Release);
            return;
        }
        let state = Arc::new(PlayerState::new(
            id,
            username.to_string(),
            PALETTE[0],
            0,
            0,
            (0, 0),
        ));
        state.bind_reliable(handle.clone());
        self.global.add(state);
    }

    /// PLAYER_JOIN at the global level: bind, and when the sender belongs
    /// to a running match, re-admit them there.
    async fn handle_global_join(
        &self,
        state: &Arc<PlayerState>,
        conn_id: u64,
        claimed: (i32, i32),
    ) {
        let Some(handle) = self.conn_handle(conn_id) else {
            return;
        };
        state.bind_reliable(handle.clone());
        if let Some(instance) = self.instance_of(state.id).await {
            instance
                .rejoin(state.id, Some(claimed), handle)
                .await;
        }
    }

    // ---- unreliable path ------------------------------------------------

    pub async fn handle_unreliable(&self, addr: std::net::SocketAddr, packet: Packet) {
        let sender = packet.sender;
        let Some(state) = self.global.get(sender) else {
            return;
        };
        let now = now_ms();
        if !self.limiter.allow_unreliable(sender, now) {
            return;
        }

        // Stale datagrams (reordered or replayed) are discarded by
        // sequence number.
        let last = state.last_unreliable_seq.load(Ordering::Acquire);
        if packet.sequence <= last && last != 0 {
            return;
        }
        state
            .last_unreliable_seq
            .store(packet.sequence, Ordering::Release);

        let instance = self.instance_of(sender).await;
        if matches!(packet.payload, Payload::Heartbeat) {
            state.last_heartbeat.store(now, Ordering::Release);
            state.bind_unreliable(addr);
            if let Some(instance) = &instance
                && let Some(in_match) = instance.registry.get(sender)
            {
                in_match.last_heartbeat.store(now, Ordering::Release);
                in_match.bind_unreliable(addr);
            }
            return;
        }

        // Spoof gate: non-heartbeat datagrams must come from the bound
        // peer address.
        if state.bindings().unreliable != Some(addr) {
            tracing::debug!(player = %sender, %addr, "Datagram from unbound address dropped.");
            return;
        }
        if let Some(instance) = instance {
            instance.handle_packet(packet).await;
        }
    }

    // ---- lobby actions --------------------------------------------------

    async fn handle_lobby_action(&self, state: &Arc<PlayerState>, payload: Payload) {
        let Payload::LobbyAction {
            action,
            lobby,
            map_index,
            duration_min,
            max_players,
            status: _,
            name,
            character_id,
            game_mode,
            team_size,
            ..
        } = payload
        else {
            return;
        };
        match action {
            LobbyCommand::ListRequest => {
                for entry in self.lobbies.list().await {
                    self.outbound
                        .send_to_player(
                            state,
                            PlayerId::ZERO,
                            entry.describe(LobbyCommand::ListEntry),
                        )
                        .await;
                }
                self.outbound
                    .send_to_player(
                        state,
                        PlayerId::ZERO,
                        lobby_action_simple(LobbyCommand::ListEnd, 0),
                    )
                    .await;
            }
            LobbyCommand::Create => {
                match self
                    .lobbies
                    .create(state.id, &name, map_index, duration_min, max_players)
                    .await
                {
                    Ok(created) => {
                        self.outbound
                            .send_to_player(
                                state,
                                PlayerId::ZERO,
                                created.describe(LobbyCommand::Joined),
                            )
                            .await;
                    }
                    Err(err) => {
                        tracing::info!(player = %state.id, ?err, "Lobby create refused.");
                    }
                }
            }
            LobbyCommand::Join => match self.lobbies.join(state.id, lobby).await {
                Ok(joined) => {
                    self.outbound
                        .send_to_player(
                            state,
                            PlayerId::ZERO,
                            joined.describe(LobbyCommand::Joined),
                        )
                        .await;
                    let others: Vec<PlayerId> = joined
                        .members
                        .iter()
                        .copied()
                        .filter(|m| *m != state.id && !m.is_bot())
                        .collect();
                    let mut announce = joined.describe(LobbyCommand::PlayerJoined);
                    if let Payload::LobbyAction { name, .. } = &mut announce {
                        *name = state.name.clone();
                    }
                    self.notify_members(&others, state.id, announce).await;
                }
                Err(err) => {
                    // The absence of a JOINED reply carries the refusal.
                    tracing::info!(player = %state.id, lobby, ?err, "Lobby join refused.");
                }
            },
            LobbyCommand::Leave => {
                if let Some(instance) = self.instance_of(state.id).await {
                    instance.remove_player(state.id).await;
                }
                match self.lobbies.leave(state.id).await {
                    LeaveOutcome::Closed { lobby_id, members } => {
                        self.notify_lobby_closed(lobby_id, &members).await;
                        if let Some(instance) = self.instance(lobby_id) {
                            instance.end_game();
                        }
                    }
                    LeaveOutcome::Left { lobby_id, members } => {
                        self.notify_members(
                            &members,
                            state.id,
                            lobby_action_simple(LobbyCommand::PlayerLeft, lobby_id),
                        )
                        .await;
                    }
                    LeaveOutcome::NotInLobby => {}
                }
            }
            LobbyCommand::ConfigUpdate => {
                match self
                    .lobbies
                    .update_config(
                        state.id, lobby, map_index, duration_min, max_players, game_mode,
                        team_size,
                    )
                    .await
                {
                    Ok((updated, evicted)) => {
                        let humans: Vec<PlayerId> = updated
                            .members
                            .iter()
                            .copied()
                            .filter(|m| !m.is_bot())
                            .collect();
                        self.notify_members(
                            &humans,
                            PlayerId::ZERO,
                            updated.describe(LobbyCommand::ConfigUpdate),
                        )
                        .await;
                        for bot in evicted {
                            self.notify_members(
                                &humans,
                                bot,
                                lobby_action_simple(LobbyCommand::PlayerLeft, updated.id),
                            )
                            .await;
                        }
                    }
                    Err(err) => {
                        tracing::info!(player = %state.id, ?err, "Config update refused.");
                    }
                }
            }
            LobbyCommand::CharacterSelect => {
                match self.lobbies.select_character(state.id, character_id).await {
                    Ok(lobby_id) => {
                        if let Some(snapshot) = self.lobbies.lobby_of(state.id).await {
                            let humans: Vec<PlayerId> = snapshot
                                .members
                                .iter()
                                .copied()
                                .filter(|m| !m.is_bot())
                                .collect();
                            let mut announce =
                                lobby_action_simple(LobbyCommand::CharacterSelect, lobby_id);
                            if let Payload::LobbyAction { character_id: c, .. } = &mut announce {
                                *c = character_id;
                            }
                            self.notify_members(&humans, state.id, announce).await;
                        }
                    }
                    Err(err) => {
                        tracing::info!(player = %state.id, ?err, "Character select refused.");
                    }
                }
            }
            LobbyCommand::AddBot => match self.lobbies.add_bot(state.id).await {
                Ok((bot, snapshot)) => {
                    let humans: Vec<PlayerId> = snapshot
                        .members
                        .iter()
                        .copied()
                        .filter(|m| !m.is_bot())
                        .collect();
                    let mut announce = snapshot.describe(LobbyCommand::PlayerJoined);
                    if let Payload::LobbyAction { name, .. } = &mut announce {
                        *name = bot_name(bot);
                    }
                    self.notify_members(&humans, bot, announce).await;
                }
                Err(err) => {
                    tracing::info!(player = %state.id, ?err, "Add bot refused.");
                }
            },
            LobbyCommand::RemoveBot => match self.lobbies.remove_bot(state.id).await {
                Ok((bot, snapshot)) => {
                    let humans: Vec<PlayerId> = snapshot
                        .members
                        .iter()
                        .copied()
                        .filter(|m| !m.is_bot())
                        .collect();
                    self.notify_members(
                        &humans,
                        bot,
                        lobby_action_simple(LobbyCommand::PlayerLeft, snapshot.id),
                    )
                    .await;
                }
                Err(err) => {
                    tracing::info!(player = %state.id, ?err, "Remove bot refused.");
                }
            },
            LobbyCommand::Start => match self.lobbies.start(state.id).await {
                Ok(plan) => {
                    self.start_instance(plan).await;
                }
                Err(LobbyError::NotWaiting) => {
                    // Double START from a trigger-happy host; idempotent.
                }
                Err(err) => {
                    tracing::info!(player = %state.id, ?err, "Start refused.");
                }
            },
            _ => {
                tracing::debug!(player = %state.id, ?action, "Server-only lobby action ignored.");
            }
        }
    }

    // ---- queue ----------------------------------------------------------

    async fn handle_queue(&self, state: &Arc<PlayerState>, action: QueueAction, character_id: u8) {
        let now = now_ms();
        match action {
            QueueAction::Join => {
                if self.lobbies.lobby_of(state.id).await.is_some() {
                    tracing::info!(player = %state.id, "Queue join refused, already in a lobby.");
                    return;
                }
                let elo = self.store.elo(state.id).await.unwrap_or_else(|err| {
                    tracing::error!(%err, "ELO read failed, using default.");
                    store::DEFAULT_ELO
                });
                self.matchmaker.join(state.id, character_id, elo, now).await;
                self.send_queue_status().await;
            }
            QueueAction::Leave => {
                self.matchmaker.leave(state.id).await;
            }
            QueueAction::CharacterChange => {
                self.matchmaker.change_character(state.id, character_id).await;
            }
            QueueAction::Status | QueueAction::MatchFound => {
                // Server-to-client only.
            }
        }
    }

    async fn matchmaking_tick(&self) {
        let now = now_ms();
        let max = self.config.max_lobby_players as usize;
        if let Some(entries) = self
            .matchmaker
            .take_match(max, self.config.queue_age_limit_s * 1000, now)
            .await
        {
            let members: Vec<(PlayerId, u8)> =
                entries.iter().map(|e| (e.id, e.character_id)).collect();
            let plan = self
                .lobbies
                .create_ranked(
                    &members,
                    RANKED_MAP_INDEX,
                    RANKED_DURATION_MIN,
                    self.config.max_lobby_players,
                )
                .await;
            tracing::info!(lobby = plan.lobby_id, players = members.len(), "Ranked match formed.");
            for (member, _) in &members {
                if let Some(state) = self.global.get(*member) {
                    let payload = Payload::RankedQueue {
                        action: QueueAction::MatchFound,
                        character_id: 0,
                        queue_size: members.len() as u16,
                        elo: 0,
                        wait_s: 0,
                        mode: GameMode::Ffa,
                        lobby: plan.lobby_id,
                    };
                    self.outbound.send_to_player(&state, PlayerId::ZERO, payload).await;
                }
            }
            self.start_instance(plan).await;
        }
        self.send_queue_status().await;
    }

    async fn send_queue_status(&self) {
        for row in self.matchmaker.status(now_ms()).await {
            if let Some(state) = self.global.get(row.id) {
                let payload = Payload::RankedQueue {
                    action: QueueAction::Status,
                    character_id: row.position as u8,
                    queue_size: row.queue_size,
                    elo: row.elo.max(0) as u32,
                    wait_s: row.waited_s,
                    mode: GameMode::Ffa,
                    lobby: 0,
                };
                self.outbound.send_to_player(&state, PlayerId::ZERO, payload).await;
            }
        }
    }

    // ---- store queries --------------------------------------------------

    async fn send_match_history(&self, state: &Arc<PlayerState>) {
        let (rows, totals) = match (
            self.store.match_history(state.id, 20).await,
            self.store.stats(state.id).await,
        ) {
            (Ok(rows), Ok(totals)) => (rows, totals),
            (Err(err), _) | (_, Err(err)) => {
                tracing::error!(%err, "Match history query failed.");
                return;
            }
        };
        let payload = Payload::MatchHistory {
            action: HistoryAction::Stats,
            map_index: 0,
            duration_min: 0,
            kills: 0,
            deaths: 0,
            rank: 0,
            played_at: 0,
            total_matches: totals.0,
            total_wins: totals.1,
        };
        self.outbound.send_to_player(state, PlayerId::ZERO, payload).await;
        for row in rows {
            let payload = Payload::MatchHistory {
                action: HistoryAction::Entry,
                map_index: row.map_index,
                duration_min: row.duration_min,
                kills: row.kills,
                deaths: row.deaths,
                rank: row.rank,
                played_at: row.played_at.max(0) as u32,
                total_matches: 0,
                total_wins: 0,
            };
            self.outbound.send_to_player(state, PlayerId::ZERO, payload).await;
        }
        let payload = Payload::MatchHistory {
            action: HistoryAction::End,
            map_index: 0,
            duration_min: 0,
            kills: 0,
            deaths: 0,
            rank: 0,
            played_at: 0,
            total_matches: 0,
            total_wins: 0,
        };
        self.outbound.send_to_player(state, PlayerId::ZERO, payload).await;
    }

    async fn send_leaderboard(&self, state: &Arc<PlayerState>) {
        let rows = match self.store.leaderboard(10).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::error!(%err, "Leaderboard query failed.");
                return;
            }
        };
        for (i, row) in rows.iter().enumerate() {
            let payload = Payload::Leaderboard {
                action: BoardAction::Entry,
                rank: (i + 1) as u16,
                elo: row.elo.max(0) as u32,
                wins: row.wins,
                matches: row.matches,
                username: row.username.clone(),
            };
            self.outbound.send_to_player(state, PlayerId::ZERO, payload).await;
        }
        let payload = Payload::Leaderboard {
            action: BoardAction::End,
            rank: 0,
            elo: 0,
            wins: 0,
            matches: 0,
            username: String::new(),
        };
        self.outbound.send_to_player(state, PlayerId::ZERO, payload).await;
    }

    // ---- instance lifecycle ---------------------------------------------

    /// Builds and launches the instance for a starting lobby: world, one
    /// instance-scoped player per roster entry (spawn point, team id,
    /// transport bindings copied from the global registry), the start
    /// broadcasts and the schedulers.
    async fn start_instance(&self, plan: StartPlan) {
        let Some(world) = world::instantiate(plan.map_index) else {
            tracing::error!(lobby = plan.lobby_id, map = plan.map_index, "Unknown map at start.");
            return;
        };
        let filename = world.filename().to_string();
        let instance = GameInstance::new(
            InstanceSettings {
                id: plan.lobby_id,
                map_index: plan.map_index,
                duration_min: plan.duration_min,
                mode: plan.game_mode,
                ranked: plan.ranked,
            },
            world,
            self.config.clone(),
            self.outbound.clone(),
            self.store.clone(),
            self.finished_tx.clone(),
        );

        // Roster construction is fully synchronous so the thread-local rng
        // never lives across an await.
        {
            let mut occupied: Vec<(i32, i32)> = Vec::new();
            let mut rng = rand::thread_rng();
            for (index, (member, character_id)) in plan.roster.iter().enumerate() {
                let spawn = instance.world.pick_spawn(&occupied, &mut rng);
                occupied.push(spawn);
                let team_id = match plan.game_mode {
                    GameMode::Teams => (index % 2) as u8 + 1,
                    GameMode::Ffa => 0,
                };
                let name = if member.is_bot() {
                    bot_name(*member)
                } else {
                    self.global
                        .get(*member)
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| format!("{member}"))
                };
                let player = Arc::new(PlayerState::new(
                    *member,
                    name,
                    PALETTE[index % PALETTE.len()],
                    *character_id,
                    team_id,
                    spawn,
                ));
                if let Some(global_state) = self.global.get(*member) {
                    let bindings = global_state.bindings();
                    if let Some(handle) = bindings.reliable {
                        player.bind_reliable(handle);
                    }
                    if let Some(addr) = bindings.unreliable {
                        player.bind_unreliable(addr);
                    }
                }
                instance.add_player(player);
            }
        }

        let roster = instance.registry.all();
        self.outbound
            .broadcast(
                &roster,
                PlayerId::ZERO,
                lobby_action_simple(LobbyCommand::GameStarting, plan.lobby_id),
            )
            .await;
        self.outbound
            .broadcast(&roster, PlayerId::ZERO, Payload::WorldInfo { filename })
            .await;

        self.instances
            .write()
            .expect("instance table poisoned")
            .insert(plan.lobby_id, instance.clone());
        instance.start();

        // Announce every participant so each client knows every assigned
        // spawn tile.
        for participant in &roster {
            let join = instance.player_join_payload(participant);
            self.outbound.broadcast(&roster, participant.id, join).await;
        }
    }

    async fn timeout_sweep(&self) {
        let now = now_ms();
        for player in self.global.timed_out(now, self.config.client_timeout_ms) {
            tracing::info!(player = %player, "Heartbeat timeout.");
            self.drop_player(player).await;
        }
    }
}

/// A LOBBY_ACTION payload that only carries the action and lobby id.
fn lobby_action_simple(action: LobbyCommand, lobby: u32) -> Payload {
    Payload::LobbyAction {
        action,
        lobby,
        map_index: 0,
        duration_min: 0,
        max_players: 0,
        player_count: 0,
        status: LobbyStatus::Waiting,
        name: String::new(),
        character_id: 0,
        game_mode: GameMode::Ffa,
        team_size: 0,
    }
}

fn bot_name(id: PlayerId) -> String {
    format!("Bot {}", id.0 as u64)
}
