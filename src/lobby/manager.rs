use super::broadcaster::LobbyBroadcaster;
use super::lobby::{Lobby, LobbyId, LobbyState};
use crate::{
    error::{ServerError, ServerResult},
    game::GameType,
    messages::{ControlMessage, MessageType},
    registry::{ClientId, ClientRegistry, DisconnectObserver},
    session::SessionDescriptor,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

const LOBBY_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const LOBBY_CODE_LENGTH: usize = 5;

/// Told when a lobby disappears, so per-lobby state elsewhere can follow.
pub trait LobbyObserver: Send + Sync {
    fn on_lobby_removed(&self, lobby_id: &str);
}

/// Owns every lobby and the client → lobby index.
///
/// Lock order is `client_lobbies` before `lobbies`; no lobby guard is ever
/// held while the index is touched, and nothing is sent while a guard is
/// held.
pub struct LobbyManager {
    lobbies: DashMap<LobbyId, Lobby>,
    client_lobbies: DashMap<ClientId, LobbyId>,
    broadcaster: LobbyBroadcaster,
    observers: RwLock<Vec<Arc<dyn LobbyObserver>>>,
}

impl LobbyManager {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            lobbies: DashMap::new(),
            client_lobbies: DashMap::new(),
            broadcaster: LobbyBroadcaster::new(registry),
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn LobbyObserver>) {
        self.observers.write().push(observer);
    }

    pub fn broadcaster(&self) -> &LobbyBroadcaster {
        &self.broadcaster
    }

    pub fn create(&self, game_type: GameType) -> LobbyId {
        loop {
            let code = generate_lobby_code();
            if let Entry::Vacant(entry) = self.lobbies.entry(code.clone()) {
                entry.insert(Lobby::new(code.clone(), game_type));
                info!("Lobby {} created ({})", code, game_type);
                return code;
            }
        }
    }

    pub fn exists(&self, lobby_id: &str) -> bool {
        self.lobbies.contains_key(lobby_id)
    }

    pub fn get(&self, lobby_id: &str) -> Option<Lobby> {
        self.lobbies.get(lobby_id).map(|l| l.clone())
    }

    pub fn list(&self) -> Vec<Lobby> {
        self.lobbies.iter().map(|l| l.clone()).collect()
    }

    pub fn lobby_of(&self, client_id: &str) -> Option<LobbyId> {
        self.client_lobbies.get(client_id).map(|l| l.clone())
    }

    pub fn join(&self, lobby_id: &str, client_id: &str) -> ServerResult<()> {
        let lobby = {
            let entry = match self.client_lobbies.entry(client_id.to_string()) {
                Entry::Occupied(existing) => {
                    return Err(ServerError::InvalidArgument(format!(
                        "client {} is already in lobby {}",
                        client_id,
                        existing.get()
                    )));
                }
                Entry::Vacant(entry) => entry,
            };
            let mut lobby = self
                .lobbies
                .get_mut(lobby_id)
                .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?;
            lobby.add_player(client_id)?;
            entry.insert(lobby_id.to_string());
            lobby.clone()
        };

        info!("Client {} joined lobby {}", client_id, lobby_id);
        self.send_join_state(client_id, &lobby);
        self.broadcast_update(&lobby);
        Ok(())
    }

    /// Removes a member. `notify` controls whether the leaver is told; the
    /// remaining member always is. An emptied lobby is deleted.
    pub fn leave(&self, lobby_id: &str, client_id: &str, notify: bool) -> ServerResult<()> {
        if !self.exists(lobby_id) {
            return Err(ServerError::lobby_not_found(lobby_id));
        }
        if self
            .client_lobbies
            .remove_if(client_id, |_, current| current == lobby_id)
            .is_none()
        {
            return Err(ServerError::NotFound(format!(
                "client {} in lobby {}",
                client_id, lobby_id
            )));
        }

        let remaining = self.lobbies.get_mut(lobby_id).map(|mut lobby| {
            lobby.remove_player(client_id);
            lobby.clone()
        });
        info!("Client {} left lobby {}", client_id, lobby_id);

        if notify {
            self.broadcaster.send_to(
                client_id,
                ControlMessage::new(MessageType::LeftLobby).with_lobby(lobby_id),
            );
        }

        match remaining {
            Some(lobby) if lobby.is_empty() => {
                if self
                    .lobbies
                    .remove_if(lobby_id, |_, l| l.is_empty())
                    .is_some()
                {
                    info!("Lobby {} is empty, removing", lobby_id);
                    self.notify_removed(lobby_id);
                }
            }
            Some(lobby) => self.broadcast_update(&lobby),
            None => {}
        }
        Ok(())
    }

    /// Deletes a lobby outright, releasing whoever is still in it.
    pub fn remove(&self, lobby_id: &str) -> ServerResult<()> {
        let (_, lobby) = self
            .lobbies
            .remove(lobby_id)
            .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?;

        for player_id in lobby.player_ids() {
            self.client_lobbies
                .remove_if(&player_id, |_, current| current == lobby_id);
            self.broadcaster.send_to(
                &player_id,
                ControlMessage::new(MessageType::LeftLobby).with_lobby(lobby_id),
            );
        }
        info!("Lobby {} removed", lobby_id);
        self.notify_removed(lobby_id);
        Ok(())
    }

    pub fn toggle_ready(&self, client_id: &str) -> ServerResult<bool> {
        let lobby_id = self
            .lobby_of(client_id)
            .ok_or_else(|| ServerError::NotFound(format!("lobby of client {}", client_id)))?;

        let (ready, lobby) = {
            let mut lobby = self
                .lobbies
                .get_mut(&lobby_id)
                .ok_or_else(|| ServerError::lobby_not_found(&lobby_id))?;
            let ready = lobby
                .toggle_ready(client_id)
                .ok_or_else(|| ServerError::client_not_found(client_id))?;
            (ready, lobby.clone())
        };

        debug!("Client {} ready={} in lobby {}", client_id, ready, lobby_id);
        self.broadcast_update(&lobby);
        Ok(ready)
    }

    pub fn is_ready(&self, lobby_id: &str) -> bool {
        self.lobbies.get(lobby_id).is_some_and(|l| l.is_ready())
    }

    /// Stores the session's parameters as the active configuration and
    /// pushes them to both members.
    pub fn configure(&self, lobby_id: &str, session: SessionDescriptor) -> ServerResult<()> {
        let players = {
            let mut lobby = self
                .lobbies
                .get_mut(lobby_id)
                .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?;
            lobby.configure(session.clone())?;
            lobby.player_ids()
        };

        debug!(
            "Lobby {} configured with session {}",
            lobby_id, session.session_id
        );
        self.broadcaster
            .broadcast(&players, session.configure_message(lobby_id));
        Ok(())
    }

    pub fn clear_configuration(&self, lobby_id: &str) -> ServerResult<()> {
        let players = {
            let mut lobby = self
                .lobbies
                .get_mut(lobby_id)
                .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?;
            lobby.clear_configuration();
            lobby.player_ids()
        };

        self.broadcaster.broadcast(
            &players,
            ControlMessage::new(MessageType::NoSessions).with_lobby(lobby_id),
        );
        Ok(())
    }

    /// Both members of a ready lobby, in join order.
    pub fn ready_players(&self, lobby_id: &str) -> ServerResult<[ClientId; 2]> {
        let lobby = self
            .lobbies
            .get(lobby_id)
            .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?;
        if lobby.state == LobbyState::Playing {
            return Err(ServerError::InvalidState(format!(
                "lobby {} is already playing",
                lobby_id
            )));
        }
        if !lobby.is_ready() {
            return Err(ServerError::InvalidState(format!(
                "lobby {} is not ready",
                lobby_id
            )));
        }
        let players = lobby.player_ids();
        Ok([players[0].clone(), players[1].clone()])
    }

    pub fn start_game(&self, lobby_id: &str) -> ServerResult<()> {
        self.lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?
            .start_game()
    }

    /// Back to `WAITING` with readiness cleared.
    pub fn finish_game(&self, lobby_id: &str) -> ServerResult<()> {
        let lobby = {
            let mut lobby = self
                .lobbies
                .get_mut(lobby_id)
                .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?;
            lobby.finish_game();
            lobby.clone()
        };
        self.broadcast_update(&lobby);
        Ok(())
    }

    pub fn set_experiment_running(&self, lobby_id: &str, running: bool) -> ServerResult<()> {
        let mut lobby = self
            .lobbies
            .get_mut(lobby_id)
            .ok_or_else(|| ServerError::lobby_not_found(lobby_id))?;
        lobby.experiment_running = running;
        Ok(())
    }

    /// Replays lobby membership and configuration to a reconnected client.
    pub fn resend_to(&self, client_id: &str) -> bool {
        let Some(lobby) = self.lobby_of(client_id).and_then(|id| self.get(&id)) else {
            return false;
        };
        self.send_join_state(client_id, &lobby);
        self.broadcaster.send_to(client_id, update_message(&lobby));
        true
    }

    fn send_join_state(&self, client_id: &str, lobby: &Lobby) {
        let mut joined = ControlMessage::new(MessageType::JoinedLobby)
            .with_lobby(lobby.id.clone())
            .with_player(client_id);
        joined.game_type = Some(lobby.game_type);
        self.broadcaster.send_to(client_id, joined);

        if let Some(session) = &lobby.current_session {
            self.broadcaster
                .send_to(client_id, session.configure_message(&lobby.id));
        }
    }

    fn broadcast_update(&self, lobby: &Lobby) {
        self.broadcaster
            .broadcast(&lobby.player_ids(), update_message(lobby));
    }

    fn notify_removed(&self, lobby_id: &str) {
        let observers = self.observers.read().clone();
        for observer in observers {
            observer.on_lobby_removed(lobby_id);
        }
    }
}

impl DisconnectObserver for LobbyManager {
    fn on_client_disconnect(&self, client_id: &str) {
        if let Some(lobby_id) = self.lobby_of(client_id) {
            if let Err(e) = self.leave(&lobby_id, client_id, false) {
                debug!(
                    "Lobby cleanup for client {} already done: {}",
                    client_id, e
                );
            }
        }
    }
}

fn update_message(lobby: &Lobby) -> ControlMessage {
    let mut update = ControlMessage::new(MessageType::LobbyUpdate)
        .with_lobby(lobby.id.clone())
        .with_data(lobby.ready_states());
    update.game_type = Some(lobby.game_type);
    update
}

fn generate_lobby_code() -> String {
    let mut rng = rand::rng();
    (0..LOBBY_CODE_LENGTH)
        .map(|_| LOBBY_CODE_CHARSET[rng.random_range(0..LOBBY_CODE_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestClient, contains_response_of_type};
    use std::time::Duration;

    fn setup() -> (Arc<ClientRegistry>, LobbyManager) {
        let registry = Arc::new(ClientRegistry::new(Duration::from_secs(60)));
        let lobbies = LobbyManager::new(Arc::clone(&registry));
        (registry, lobbies)
    }

    #[test]
    fn test_join_and_leave_flow() {
        let (registry, lobbies) = setup();
        let mut alice = TestClient::register(&registry, "alice");
        let mut bob = TestClient::register(&registry, "bob");

        let lobby_id = lobbies.create(GameType::WaterRipples);
        assert_eq!(lobby_id.len(), LOBBY_CODE_LENGTH);

        lobbies.join(&lobby_id, "alice").unwrap();
        lobbies.join(&lobby_id, "bob").unwrap();
        assert_eq!(lobbies.lobby_of("alice"), Some(lobby_id.clone()));
        assert!(contains_response_of_type(
            &alice.drain(),
            MessageType::JoinedLobby
        ));

        lobbies.leave(&lobby_id, "alice", true).unwrap();
        assert!(contains_response_of_type(&alice.drain(), MessageType::LeftLobby));
        assert!(contains_response_of_type(&bob.drain(), MessageType::LobbyUpdate));
        assert_eq!(lobbies.lobby_of("alice"), None);

        lobbies.leave(&lobby_id, "bob", true).unwrap();
        assert!(!lobbies.exists(&lobby_id));
    }

    #[test]
    fn test_join_rejections() {
        let (_registry, lobbies) = setup();
        assert!(lobbies.join("NOPE0", "a").unwrap_err().is_not_found());

        let first = lobbies.create(GameType::WaterRipples);
        let second = lobbies.create(GameType::WaterRipples);
        lobbies.join(&first, "a").unwrap();
        assert!(matches!(
            lobbies.join(&second, "a"),
            Err(ServerError::InvalidArgument(_))
        ));

        lobbies.join(&first, "b").unwrap();
        assert!(matches!(
            lobbies.join(&first, "c"),
            Err(ServerError::InvalidArgument(_))
        ));
        // A rejected join leaves no index entry behind
        assert_eq!(lobbies.lobby_of("c"), None);
        assert_eq!(lobbies.get(&first).unwrap().players().len(), 2);
    }

    #[test]
    fn test_leave_rejections() {
        let (_registry, lobbies) = setup();
        let lobby_id = lobbies.create(GameType::WaterRipples);
        assert!(lobbies.leave("NOPE0", "a", true).unwrap_err().is_not_found());
        assert!(lobbies.leave(&lobby_id, "a", true).unwrap_err().is_not_found());
    }

    #[test]
    fn test_toggle_ready_requires_lobby() {
        let (_registry, lobbies) = setup();
        assert!(lobbies.toggle_ready("a").unwrap_err().is_not_found());

        let lobby_id = lobbies.create(GameType::WaterRipples);
        lobbies.join(&lobby_id, "a").unwrap();
        lobbies.join(&lobby_id, "b").unwrap();
        assert!(lobbies.toggle_ready("a").unwrap());
        assert!(!lobbies.is_ready(&lobby_id));
        assert!(lobbies.toggle_ready("b").unwrap());
        assert!(lobbies.is_ready(&lobby_id));
        assert!(!lobbies.toggle_ready("b").unwrap());
        assert!(!lobbies.is_ready(&lobby_id));
    }

    #[test]
    fn test_configure_pushes_to_members_and_joiners() {
        let (registry, lobbies) = setup();
        let mut alice = TestClient::register(&registry, "alice");
        let mut bob = TestClient::register(&registry, "bob");
        let lobby_id = lobbies.create(GameType::WaterRipples);
        lobbies.join(&lobby_id, "alice").unwrap();
        alice.drain();

        let session = SessionDescriptor::defaults_for(GameType::WineGlasses, 3);
        lobbies.configure(&lobby_id, session).unwrap();
        assert!(contains_response_of_type(
            &alice.drain(),
            MessageType::ConfigureGame
        ));

        lobbies.join(&lobby_id, "bob").unwrap();
        let received = bob.drain();
        assert!(contains_response_of_type(&received, MessageType::JoinedLobby));
        assert!(contains_response_of_type(&received, MessageType::ConfigureGame));

        assert!(
            lobbies
                .configure("NOPE0", SessionDescriptor::defaults_for(GameType::WineGlasses, 4))
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_disconnect_is_silent_leave() {
        let (registry, lobbies) = setup();
        let mut alice = TestClient::register(&registry, "alice");
        let lobby_id = lobbies.create(GameType::WaterRipples);
        lobbies.join(&lobby_id, "alice").unwrap();
        alice.drain();

        lobbies.on_client_disconnect("alice");
        assert!(alice.drain().is_empty());
        assert!(!lobbies.exists(&lobby_id));

        // Second notification for the same departure is a no-op
        lobbies.on_client_disconnect("alice");
    }

    #[test]
    fn test_membership_is_unique_across_operations() {
        let (_registry, lobbies) = setup();
        let l1 = lobbies.create(GameType::WaterRipples);
        let l2 = lobbies.create(GameType::WineGlasses);
        lobbies.join(&l1, "a").unwrap();
        let _ = lobbies.join(&l2, "a");
        lobbies.join(&l2, "b").unwrap();
        lobbies.on_client_disconnect("a");
        lobbies.join(&l2, "a").unwrap();
        let _ = lobbies.join(&l1, "b");

        let memberships = lobbies
            .list()
            .iter()
            .filter(|l| l.contains("a"))
            .count();
        assert_eq!(memberships, 1);
        assert!(lobbies.list().iter().all(|l| l.players().len() <= 2));
    }

    #[test]
    fn test_remove_releases_members() {
        let (_registry, lobbies) = setup();
        let lobby_id = lobbies.create(GameType::WaterRipples);
        lobbies.join(&lobby_id, "a").unwrap();
        lobbies.remove(&lobby_id).unwrap();
        assert_eq!(lobbies.lobby_of("a"), None);
        assert!(lobbies.remove(&lobby_id).unwrap_err().is_not_found());
    }
}
