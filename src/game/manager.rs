use super::instance::{GameContext, GameInstance, create_instance};
use super::result::{ResultSink, SessionOutcome};
use crate::{
    data_channel::DataSender,
    error::{ServerError, ServerResult},
    lobby::{LobbyId, LobbyManager, LobbyObserver},
    messages::{ControlMessage, DataCodec, DataMessage, MessageType},
    registry::{ClientId, ClientRegistry, DisconnectObserver},
    session::{SessionDescriptor, SessionId},
    timesync::TimeSyncService,
};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Told when a game ended because a player vanished, so whoever drives the
/// lobby can stop too.
pub trait GameTerminationHandler: Send + Sync {
    fn on_game_aborted(&self, lobby_id: &str);
}

pub struct RunningGame {
    pub lobby_id: LobbyId,
    pub session_id: SessionId,
    pub session: SessionDescriptor,
    pub players: [ClientId; 2],
    pub start_time_ms: i64,
    instance: Box<dyn GameInstance>,
}

impl RunningGame {
    fn player_index(&self, client_id: &str) -> Option<usize> {
        self.players.iter().position(|p| p == client_id)
    }

    fn start_message(&self, kind: MessageType) -> ControlMessage {
        let mut msg = ControlMessage::new(kind)
            .with_lobby(self.lobby_id.clone())
            .with_timestamp(self.start_time_ms);
        self.session.fill(&mut msg);
        msg.session_id = Some(self.session_id);
        msg
    }
}

/// At most one running game per lobby, and a client is in at most one.
pub struct GameManager {
    games: DashMap<LobbyId, Arc<RunningGame>>,
    client_games: DashMap<ClientId, LobbyId>,
    registry: Arc<ClientRegistry>,
    lobbies: Arc<LobbyManager>,
    time_sync: Arc<TimeSyncService>,
    data: DataSender,
    results: Arc<dyn ResultSink>,
    termination: OnceCell<Weak<dyn GameTerminationHandler>>,
    start_delay_ms: i64,
}

impl GameManager {
    pub fn new(
        registry: Arc<ClientRegistry>,
        lobbies: Arc<LobbyManager>,
        time_sync: Arc<TimeSyncService>,
        data: DataSender,
        results: Arc<dyn ResultSink>,
        start_delay_ms: u64,
    ) -> Self {
        Self {
            games: DashMap::new(),
            client_games: DashMap::new(),
            registry,
            lobbies,
            time_sync,
            data,
            results,
            termination: OnceCell::new(),
            start_delay_ms: start_delay_ms as i64,
        }
    }

    /// Can be set once; later calls are ignored.
    pub fn set_termination_handler(&self, handler: Weak<dyn GameTerminationHandler>) {
        if self.termination.set(handler).is_err() {
            warn!("Game termination handler already set");
        }
    }

    /// Starts a game in a ready lobby and tells both players when it begins.
    /// Plays the lobby's configured session, or the game type's defaults.
    /// Returns the agreed start time.
    pub fn start(&self, lobby_id: &str, session_id: SessionId) -> ServerResult<i64> {
        let lobby = self
            .lobbies
            .get(lobby_id)
            .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?;
        let session = lobby
            .current_session
            .unwrap_or_else(|| SessionDescriptor::defaults_for(lobby.game_type, session_id));
        self.start_with(lobby_id, session_id, session)
    }

    /// Starts a game playing exactly `session`.
    pub fn start_session(&self, lobby_id: &str, session: SessionDescriptor) -> ServerResult<i64> {
        self.start_with(lobby_id, session.session_id, session)
    }

    fn start_with(
        &self,
        lobby_id: &str,
        session_id: SessionId,
        session: SessionDescriptor,
    ) -> ServerResult<i64> {
        let game = self.prepare(lobby_id, session_id, session)?;
        // Indexed before the lobby turns PLAYING so a departure in between
        // still finds the game to end
        self.index(&game);
        self.commit(&game)?;
        Ok(game.start_time_ms)
    }

    fn prepare(
        &self,
        lobby_id: &str,
        session_id: SessionId,
        session: SessionDescriptor,
    ) -> ServerResult<Arc<RunningGame>> {
        let players = self.lobbies.ready_players(lobby_id)?;
        for player in &players {
            self.ensure_registered(lobby_id, player)?;
        }

        if !self.time_sync.is_synced() {
            warn!("Starting game in lobby {} before the clock is synced", lobby_id);
        }
        let start_time_ms = self.time_sync.now_ms() + self.start_delay_ms;

        let instance = create_instance(GameContext {
            lobby_id: lobby_id.to_string(),
            players: players.clone(),
            session: session.clone(),
            start_time_ms,
            registry: Arc::clone(&self.registry),
            data: self.data.clone(),
        });
        Ok(Arc::new(RunningGame {
            lobby_id: lobby_id.to_string(),
            session_id,
            session,
            players,
            start_time_ms,
            instance,
        }))
    }

    fn index(&self, game: &Arc<RunningGame>) {
        self.games.insert(game.lobby_id.clone(), Arc::clone(game));
        for player in &game.players {
            self.client_games
                .insert(player.clone(), game.lobby_id.clone());
        }
    }

    /// Moves the lobby to PLAYING and announces the game, or withdraws the
    /// game if the lobby changed since it was indexed.
    fn commit(&self, game: &Arc<RunningGame>) -> ServerResult<()> {
        if let Err(e) = self.lobbies.start_game(&game.lobby_id) {
            self.unindex(game);
            return Err(e);
        }
        info!(
            "Game {} started in lobby {} at {}",
            game.session.game_type, game.lobby_id, game.start_time_ms
        );
        self.lobbies
            .broadcaster()
            .broadcast(&game.players, game.start_message(MessageType::StartGame));
        Ok(())
    }

    fn ensure_registered(&self, lobby_id: &str, client_id: &str) -> ServerResult<()> {
        if self.registry.contains(client_id) {
            return Ok(());
        }
        error!(
            "Ready client {} of lobby {} is not registered",
            client_id, lobby_id
        );
        Err(ServerError::Internal(format!(
            "client {} of lobby {} has no identity",
            client_id, lobby_id
        )))
    }

    /// Drops the game's index entries, if they still belong to it.
    fn unindex(&self, game: &Arc<RunningGame>) {
        self.games
            .remove_if(&game.lobby_id, |_, current| Arc::ptr_eq(current, game));
        for player in &game.players {
            self.client_games
                .remove_if(player, |_, current| *current == game.lobby_id);
        }
    }

    /// Routes a player's data-channel action to their game.
    pub fn handle_action(
        &self,
        client_id: &str,
        action: &DataMessage,
        codec: DataCodec,
    ) -> ServerResult<()> {
        let game = self
            .game_of(client_id)
            .and_then(|lobby_id| self.get(&lobby_id))
            .ok_or_else(|| ServerError::NotFound(format!("game of client {}", client_id)))?;
        let index = game.player_index(client_id).ok_or_else(|| {
            ServerError::Internal(format!(
                "client {} indexed to game in lobby {} without playing in it",
                client_id, game.lobby_id
            ))
        })?;
        game.instance.handle_action(index, action, codec)
    }

    /// Ends the lobby's game, tells both players and records the outcome.
    pub fn end(
        &self,
        lobby_id: &str,
        experiment_id: Option<&str>,
        error: Option<String>,
    ) -> ServerResult<()> {
        let (_, game) = self
            .games
            .remove(lobby_id)
            .ok_or_else(|| ServerError::NotFound(format!("game in lobby {}", lobby_id)))?;
        for player in &game.players {
            self.client_games
                .remove_if(player, |_, current| current == lobby_id);
        }

        let mut end = ControlMessage::new(MessageType::EndGame).with_lobby(lobby_id);
        end.session_id = Some(game.session_id);
        if let Some(reason) = &error {
            end.message = Some(reason.clone());
        }
        self.lobbies.broadcaster().broadcast(&game.players, end);

        if let Err(e) = self.lobbies.finish_game(lobby_id) {
            debug!("Lobby {} gone before its game ended: {}", lobby_id, e);
        }

        match &error {
            Some(reason) => warn!("Game in lobby {} ended early: {}", lobby_id, reason),
            None => info!("Game in lobby {} ended", lobby_id),
        }
        self.results.record(&SessionOutcome {
            lobby_id: lobby_id.to_string(),
            session_id: game.session_id,
            experiment_id: experiment_id.map(str::to_string),
            game_type: game.session.game_type,
            players: game.players.clone(),
            start_time_ms: game.start_time_ms,
            end_time_ms: self.time_sync.now_ms(),
            error,
        });
        Ok(())
    }

    /// Ends the client's game, if any, with `reason` and notifies the
    /// termination handler. Returns the lobby whose game ended.
    pub fn abort_client_game(&self, client_id: &str, reason: &str) -> Option<LobbyId> {
        let lobby_id = self.game_of(client_id)?;
        match self.end(&lobby_id, None, Some(reason.to_string())) {
            Ok(()) => {
                self.notify_aborted(&lobby_id);
                Some(lobby_id)
            }
            Err(e) => {
                debug!("Game of client {} already over: {}", client_id, e);
                None
            }
        }
    }

    /// Re-sends whatever the client needs to resume: the running game if
    /// there is one, otherwise its lobby state.
    pub fn on_client_reconnect(&self, client_id: &str) {
        let game = self.game_of(client_id).and_then(|l| self.get(&l));
        match game {
            Some(game) => {
                info!(
                    "Client {} rejoining game in lobby {}",
                    client_id, game.lobby_id
                );
                self.registry
                    .send(client_id, game.start_message(MessageType::ReconnectToGame));
            }
            None => {
                self.lobbies.resend_to(client_id);
            }
        }
    }

    fn notify_aborted(&self, lobby_id: &str) {
        if let Some(handler) = self.termination.get().and_then(Weak::upgrade) {
            handler.on_game_aborted(lobby_id);
        }
    }

    pub fn get(&self, lobby_id: &str) -> Option<Arc<RunningGame>> {
        self.games.get(lobby_id).map(|g| Arc::clone(&g))
    }

    pub fn game_of(&self, client_id: &str) -> Option<LobbyId> {
        self.client_games.get(client_id).map(|l| l.clone())
    }

    pub fn is_running(&self, lobby_id: &str) -> bool {
        self.games.contains_key(lobby_id)
    }

    pub fn lobbies_with_running_games(&self) -> Vec<LobbyId> {
        self.games.iter().map(|g| g.key().clone()).collect()
    }
}

impl DisconnectObserver for GameManager {
    fn on_client_disconnect(&self, client_id: &str) {
        self.abort_client_game(client_id, &format!("client {} disconnected", client_id));
    }
}

impl LobbyObserver for GameManager {
    fn on_lobby_removed(&self, lobby_id: &str) {
        let reason = format!("lobby {} removed", lobby_id);
        if self.end(lobby_id, None, Some(reason)).is_ok() {
            self.notify_aborted(lobby_id);
        }
    }
}
