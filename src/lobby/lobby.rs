use crate::{
    error::{ServerError, ServerResult},
    game::GameType,
    registry::ClientId,
    session::SessionDescriptor,
};
use serde::Serialize;
use serde_json::{Value, json};

pub type LobbyId = String;

pub const MAX_PLAYERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LobbyState {
    Waiting,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPlayer {
    pub id: ClientId,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lobby {
    pub id: LobbyId,
    pub game_type: GameType,
    pub state: LobbyState,
    pub current_session: Option<SessionDescriptor>,
    pub has_sessions: bool,
    pub experiment_running: bool,
    players: Vec<LobbyPlayer>,
}

impl Lobby {
    pub fn new(id: LobbyId, game_type: GameType) -> Self {
        Self {
            id,
            game_type,
            state: LobbyState::Waiting,
            current_session: None,
            has_sessions: false,
            experiment_running: false,
            players: Vec::with_capacity(MAX_PLAYERS),
        }
    }

    #[cfg(test)]
    pub fn players(&self) -> &[LobbyPlayer] {
        &self.players
    }

    pub fn player_ids(&self) -> Vec<ClientId> {
        self.players.iter().map(|p| p.id.clone()).collect()
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.players.iter().any(|p| p.id == player_id)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= MAX_PLAYERS
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn add_player(&mut self, player_id: &str) -> ServerResult<()> {
        if self.contains(player_id) {
            return Err(ServerError::InvalidArgument(format!(
                "client {} is already in lobby {}",
                player_id, self.id
            )));
        }
        if self.is_full() {
            return Err(ServerError::InvalidArgument(format!(
                "lobby {} is full",
                self.id
            )));
        }
        self.players.push(LobbyPlayer {
            id: player_id.to_string(),
            ready: false,
        });
        Ok(())
    }

    pub fn remove_player(&mut self, player_id: &str) -> bool {
        let before = self.players.len();
        self.players.retain(|p| p.id != player_id);
        self.players.len() != before
    }

    /// Flips a player's readiness, returning the new value.
    pub fn toggle_ready(&mut self, player_id: &str) -> Option<bool> {
        let player = self.players.iter_mut().find(|p| p.id == player_id)?;
        player.ready = !player.ready;
        Some(player.ready)
    }

    pub fn reset_ready_states(&mut self) {
        for player in self.players.iter_mut() {
            player.ready = false;
        }
    }

    /// Two players, both ready.
    pub fn is_ready(&self) -> bool {
        self.players.len() == MAX_PLAYERS && self.players.iter().all(|p| p.ready)
    }

    pub fn configure(&mut self, session: SessionDescriptor) -> ServerResult<()> {
        if self.state == LobbyState::Playing {
            return Err(ServerError::InvalidState(format!(
                "lobby {} is playing",
                self.id
            )));
        }
        self.game_type = session.game_type;
        self.current_session = Some(session);
        self.has_sessions = true;
        Ok(())
    }

    pub fn clear_configuration(&mut self) {
        self.current_session = None;
        self.has_sessions = false;
    }

    pub fn start_game(&mut self) -> ServerResult<()> {
        if self.state == LobbyState::Playing {
            return Err(ServerError::InvalidState(format!(
                "lobby {} is already playing",
                self.id
            )));
        }
        if !self.is_ready() {
            return Err(ServerError::InvalidState(format!(
                "lobby {} is not ready",
                self.id
            )));
        }
        self.state = LobbyState::Playing;
        Ok(())
    }

    pub fn finish_game(&mut self) {
        self.state = LobbyState::Waiting;
        self.reset_ready_states();
    }

    pub fn ready_states(&self) -> Vec<Value> {
        self.players
            .iter()
            .map(|p| json!({ "playerId": p.id, "ready": p.ready }))
            .collect()
    }
}
