use crate::{
    error::{ServerError, ServerResult},
    experiment::ExperimentOrchestrator,
    game::GameManager,
    lobby::LobbyManager,
    messages::{ControlMessage, MessageType},
    registry::ClientRegistry,
    session::{NewSession, SessionDescriptor, SessionQueue},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// Entry point for every manager-level request arriving on a control
/// connection. Replies are `SUCCESS` messages; failures are returned for the
/// router to turn into `ERROR`.
pub struct RequestFacade {
    registry: Arc<ClientRegistry>,
    lobbies: Arc<LobbyManager>,
    sessions: Arc<SessionQueue>,
    games: Arc<GameManager>,
    experiments: Arc<ExperimentOrchestrator>,
}

impl RequestFacade {
    pub fn new(
        registry: Arc<ClientRegistry>,
        lobbies: Arc<LobbyManager>,
        sessions: Arc<SessionQueue>,
        games: Arc<GameManager>,
        experiments: Arc<ExperimentOrchestrator>,
    ) -> Self {
        Self {
            registry,
            lobbies,
            sessions,
            games,
            experiments,
        }
    }

    pub async fn handle(
        &self,
        client_id: &str,
        request: &ControlMessage,
    ) -> ServerResult<ControlMessage> {
        request.validate()?;
        debug!("Client {} requested {:?}", client_id, request.kind);

        let reply = ControlMessage::success();
        match request.kind {
            MessageType::CreateLobby => {
                let game_type = request
                    .game_type
                    .ok_or(ServerError::MissingFields(vec!["gameType"]))?;
                let lobby_id = self.lobbies.create(game_type);
                Ok(reply.with_lobby(lobby_id))
            }
            MessageType::JoinLobby => {
                let lobby_id = request.lobby()?;
                self.lobbies.join(lobby_id, request.player()?)?;
                Ok(reply.with_lobby(lobby_id))
            }
            MessageType::LeaveLobby => {
                let (lobby_id, player_id) = (request.lobby()?, request.player()?);
                self.games
                    .abort_client_game(player_id, &format!("client {} left the lobby", player_id));
                self.lobbies.leave(lobby_id, player_id, true)?;
                Ok(reply.with_lobby(lobby_id))
            }
            MessageType::RemoveLobby => {
                let lobby_id = request.lobby()?;
                self.lobbies.remove(lobby_id)?;
                Ok(reply.with_lobby(lobby_id))
            }
            MessageType::ToggleReady => {
                let player_id = request.player()?;
                let ready = self.lobbies.toggle_ready(player_id)?;
                Ok(reply
                    .with_player(player_id)
                    .with_data(vec![Value::Bool(ready)]))
            }
            MessageType::CreateSession => {
                let lobby_id = request.lobby()?;
                let params = new_session(request)?;
                let session = self.sessions.create(lobby_id, params)?;
                let mut reply = reply.with_lobby(lobby_id);
                session.fill(&mut reply);
                Ok(reply)
            }
            MessageType::RemoveSession => {
                let lobby_id = request.lobby()?;
                self.sessions.remove(lobby_id, request.session()?)?;
                Ok(reply.with_lobby(lobby_id))
            }
            MessageType::ChangeSessionsOrder => {
                let lobby_id = request.lobby()?;
                let order = request
                    .session_ids
                    .as_deref()
                    .ok_or(ServerError::MissingFields(vec!["sessionIds"]))?;
                let sessions = self.sessions.reorder(lobby_id, order)?;
                session_list(reply.with_lobby(lobby_id), &sessions)
            }
            MessageType::GetSessions => {
                let lobby_id = request.lobby()?;
                let sessions = self.sessions.get(lobby_id)?;
                session_list(reply.with_lobby(lobby_id), &sessions)
            }
            MessageType::StartGame => {
                let lobby_id = request.lobby()?;
                let start_time = self.games.start(lobby_id, request.session()?)?;
                Ok(reply.with_lobby(lobby_id).with_timestamp(start_time))
            }
            MessageType::EndGame => {
                let lobby_id = request.lobby()?;
                self.games.end(lobby_id, None, None)?;
                Ok(reply.with_lobby(lobby_id))
            }
            MessageType::StartExperiment => {
                let lobby_id = request.lobby()?;
                let run_id = self.experiments.start(lobby_id)?;
                Ok(reply.with_lobby(lobby_id).with_message(run_id))
            }
            MessageType::StopExperiment => {
                let lobby_id = request.lobby()?;
                self.experiments.stop(lobby_id).await?;
                Ok(reply.with_lobby(lobby_id))
            }
            MessageType::GetLobbies => Ok(reply.with_data(to_data(&self.lobbies.list())?)),
            MessageType::GetPlayers => {
                let players = self
                    .registry
                    .list_ids()
                    .into_iter()
                    .map(|id| {
                        let lobby_id = self.lobbies.lobby_of(&id);
                        let in_game = self.games.game_of(&id).is_some();
                        let alive = self.registry.is_alive(&id);
                        json!({
                            "playerId": id,
                            "lobbyId": lobby_id,
                            "inGame": in_game,
                            "alive": alive,
                        })
                    })
                    .collect();
                Ok(reply.with_data(players))
            }
            other => Err(ServerError::Protocol(format!(
                "{:?} is not a request",
                other
            ))),
        }
    }
}

fn new_session(request: &ControlMessage) -> ServerResult<NewSession> {
    match (
        request.game_type,
        request.duration,
        request.sync_window_length,
        request.sync_tolerance,
    ) {
        (Some(game_type), Some(duration), Some(sync_window_length), Some(sync_tolerance)) => {
            Ok(NewSession {
                game_type,
                duration,
                sync_window_length,
                sync_tolerance,
                is_warmup: request.is_warmup.unwrap_or(false),
            })
        }
        _ => Err(ServerError::MissingFields(
            ControlMessage::required_fields(MessageType::CreateSession).to_vec(),
        )),
    }
}

fn session_list(
    mut reply: ControlMessage,
    sessions: &[SessionDescriptor],
) -> ServerResult<ControlMessage> {
    reply.session_ids = Some(sessions.iter().map(|s| s.session_id).collect());
    Ok(reply.with_data(to_data(sessions)?))
}

fn to_data<T: Serialize>(items: &[T]) -> ServerResult<Vec<Value>> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).map_err(|e| ServerError::Internal(e.to_string())))
        .collect()
}
