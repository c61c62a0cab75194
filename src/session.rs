use crate::{
    error::{ServerError, ServerResult},
    game::GameType,
    lobby::{LobbyId, LobbyManager, LobbyObserver},
    messages::{ControlMessage, MessageType},
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

pub type SessionId = u64;

/// One timed, parameterised round. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: SessionId,
    pub game_type: GameType,
    /// Seconds
    pub duration: u64,
    /// Milliseconds
    pub sync_window_length: u64,
    /// Milliseconds
    pub sync_tolerance: u64,
    pub is_warmup: bool,
}

impl SessionDescriptor {
    /// Parameters used when a game starts without a queued session.
    pub fn defaults_for(game_type: GameType, session_id: SessionId) -> Self {
        let data = game_type.get_data();
        Self {
            session_id,
            game_type,
            duration: data.default_duration,
            sync_window_length: data.default_sync_window_length,
            sync_tolerance: data.default_sync_tolerance,
            is_warmup: false,
        }
    }

    pub fn configure_message(&self, lobby_id: &str) -> ControlMessage {
        let mut msg = ControlMessage::new(MessageType::ConfigureGame).with_lobby(lobby_id);
        self.fill(&mut msg);
        msg
    }

    /// Copies the session parameters onto an outgoing message.
    pub fn fill(&self, msg: &mut ControlMessage) {
        msg.session_id = Some(self.session_id);
        msg.game_type = Some(self.game_type);
        msg.duration = Some(self.duration);
        msg.sync_window_length = Some(self.sync_window_length);
        msg.sync_tolerance = Some(self.sync_tolerance);
        msg.is_warmup = Some(self.is_warmup);
    }
}

/// Parameters of a session about to be queued.
#[derive(Debug, Clone, Copy)]
pub struct NewSession {
    pub game_type: GameType,
    pub duration: u64,
    pub sync_window_length: u64,
    pub sync_tolerance: u64,
    pub is_warmup: bool,
}

impl NewSession {
    fn validate(&self) -> ServerResult<()> {
        if self.duration == 0 {
            return Err(ServerError::InvalidArgument(
                "duration must be greater than zero".into(),
            ));
        }
        if self.game_type.requires_sync() {
            if self.sync_window_length == 0 {
                return Err(ServerError::InvalidArgument(format!(
                    "{} needs a sync window length greater than zero",
                    self.game_type
                )));
            }
            if self.sync_tolerance == 0 {
                return Err(ServerError::InvalidArgument(format!(
                    "{} needs a sync tolerance greater than zero",
                    self.game_type
                )));
            }
        }
        Ok(())
    }
}

/// Ordered session queues, one per lobby. The head of a lobby's queue is
/// its active configuration.
pub struct SessionQueue {
    queues: DashMap<LobbyId, Vec<SessionDescriptor>>,
    next_session_id: AtomicU64,
    lobbies: Arc<LobbyManager>,
}

impl SessionQueue {
    pub fn new(lobbies: Arc<LobbyManager>) -> Self {
        Self {
            queues: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            lobbies,
        }
    }

    pub fn create(&self, lobby_id: &str, params: NewSession) -> ServerResult<SessionDescriptor> {
        if !self.lobbies.exists(lobby_id) {
            return Err(ServerError::lobby_not_found(lobby_id));
        }
        params.validate()?;

        let session = SessionDescriptor {
            session_id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            game_type: params.game_type,
            duration: params.duration,
            sync_window_length: params.sync_window_length,
            sync_tolerance: params.sync_tolerance,
            is_warmup: params.is_warmup,
        };

        let is_first = {
            let mut queue = self.queues.entry(lobby_id.to_string()).or_default();
            queue.push(session.clone());
            queue.len() == 1
        };
        info!(
            "Session {} ({}) queued in lobby {}",
            session.session_id, session.game_type, lobby_id
        );

        if is_first {
            self.push_active(lobby_id, session.clone());
        }
        Ok(session)
    }

    pub fn remove(&self, lobby_id: &str, session_id: SessionId) -> ServerResult<()> {
        let (was_head, new_head) = {
            let mut queue = self
                .queues
                .get_mut(lobby_id)
                .ok_or_else(|| ServerError::NotFound(format!("session {}", session_id)))?;
            let position = queue
                .iter()
                .position(|s| s.session_id == session_id)
                .ok_or_else(|| ServerError::NotFound(format!("session {}", session_id)))?;
            queue.remove(position);
            (position == 0, queue.first().cloned())
        };
        debug!("Session {} removed from lobby {}", session_id, lobby_id);

        match new_head {
            None => {
                self.queues.remove_if(lobby_id, |_, q| q.is_empty());
                if let Err(e) = self.lobbies.clear_configuration(lobby_id) {
                    debug!("Lobby {} gone while clearing sessions: {}", lobby_id, e);
                }
            }
            Some(head) if was_head => self.push_active(lobby_id, head),
            Some(_) => {}
        }
        Ok(())
    }

    /// Puts the queue in the given order. The ids must be exactly the
    /// queued ones.
    pub fn reorder(
        &self,
        lobby_id: &str,
        new_order: &[SessionId],
    ) -> ServerResult<Vec<SessionDescriptor>> {
        if !self.lobbies.exists(lobby_id) {
            return Err(ServerError::lobby_not_found(lobby_id));
        }

        let reordered = {
            let mut queue = self.queues.entry(lobby_id.to_string()).or_default();
            let mut current: Vec<SessionId> = queue.iter().map(|s| s.session_id).collect();
            let mut requested = new_order.to_vec();
            current.sort_unstable();
            requested.sort_unstable();
            if current != requested {
                return Err(ServerError::InvalidArgument(format!(
                    "session ids {:?} do not match the queued sessions",
                    new_order
                )));
            }

            let reordered: Vec<SessionDescriptor> = new_order
                .iter()
                .filter_map(|id| queue.iter().find(|s| s.session_id == *id).cloned())
                .collect();
            *queue = reordered.clone();
            reordered
        };

        if let Some(head) = reordered.first() {
            self.push_active(lobby_id, head.clone());
        }
        Ok(reordered)
    }

    pub fn get(&self, lobby_id: &str) -> ServerResult<Vec<SessionDescriptor>> {
        if !self.lobbies.exists(lobby_id) {
            return Err(ServerError::lobby_not_found(lobby_id));
        }
        Ok(self
            .queues
            .get(lobby_id)
            .map(|q| q.clone())
            .unwrap_or_default())
    }

    pub fn first(&self, lobby_id: &str) -> Option<SessionDescriptor> {
        self.queues.get(lobby_id).and_then(|q| q.first().cloned())
    }

    pub fn len(&self, lobby_id: &str) -> usize {
        self.queues.get(lobby_id).map_or(0, |q| q.len())
    }

    fn push_active(&self, lobby_id: &str, session: SessionDescriptor) {
        // A lobby mid-game keeps its parameters until the game ends
        if let Err(e) = self.lobbies.configure(lobby_id, session) {
            debug!("Lobby {} not reconfigured: {}", lobby_id, e);
        }
    }
}

impl LobbyObserver for SessionQueue {
    fn on_lobby_removed(&self, lobby_id: &str) {
        if self.queues.remove(lobby_id).is_some() {
            debug!("Dropped session queue of lobby {}", lobby_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientRegistry;
    use crate::test_utils::{TestClient, contains_response_of_type};
    use std::time::Duration;

    fn setup() -> (Arc<ClientRegistry>, Arc<LobbyManager>, Arc<SessionQueue>) {
        let registry = Arc::new(ClientRegistry::new(Duration::from_secs(60)));
        let lobbies = Arc::new(LobbyManager::new(Arc::clone(&registry)));
        let sessions = Arc::new(SessionQueue::new(Arc::clone(&lobbies)));
        lobbies.add_observer(sessions.clone());
        (registry, lobbies, sessions)
    }

    fn wine_glasses(duration: u64) -> NewSession {
        NewSession {
            game_type: GameType::WineGlasses,
            duration,
            sync_window_length: 1000,
            sync_tolerance: 100,
            is_warmup: false,
        }
    }

    #[test]
    fn test_create_then_get_returns_inputs() {
        let (_registry, lobbies, sessions) = setup();
        let lobby_id = lobbies.create(GameType::WineGlasses);

        let created = sessions.create(&lobby_id, wine_glasses(60)).unwrap();
        let queued = sessions.get(&lobby_id).unwrap();

        assert_eq!(queued, vec![created.clone()]);
        assert_eq!(created.game_type, GameType::WineGlasses);
        assert_eq!(created.duration, 60);
        assert_eq!(created.sync_window_length, 1000);
        assert_eq!(created.sync_tolerance, 100);
        assert!(!created.is_warmup);
    }

    #[test]
    fn test_first_session_becomes_active_configuration() {
        let (registry, lobbies, sessions) = setup();
        let mut alice = TestClient::register(&registry, "alice");
        let lobby_id = lobbies.create(GameType::WaterRipples);
        lobbies.join(&lobby_id, "alice").unwrap();
        alice.drain();

        let first = sessions.create(&lobby_id, wine_glasses(60)).unwrap();
        assert!(contains_response_of_type(
            &alice.drain(),
            MessageType::ConfigureGame
        ));
        sessions.create(&lobby_id, wine_glasses(30)).unwrap();
        assert!(alice.drain().is_empty());

        let lobby = lobbies.get(&lobby_id).unwrap();
        assert_eq!(lobby.current_session, Some(first));
        assert!(lobby.has_sessions);
    }

    #[test]
    fn test_parameter_validation() {
        let (_registry, lobbies, sessions) = setup();
        let lobby_id = lobbies.create(GameType::WineGlasses);

        assert!(matches!(
            sessions.create(&lobby_id, wine_glasses(0)),
            Err(ServerError::InvalidArgument(_))
        ));
        let mut no_window = wine_glasses(60);
        no_window.sync_window_length = 0;
        assert!(sessions.create(&lobby_id, no_window).is_err());
        let mut no_tolerance = wine_glasses(60);
        no_tolerance.sync_tolerance = 0;
        assert!(sessions.create(&lobby_id, no_tolerance).is_err());

        // Free-form games do not need sync parameters
        let ripples = NewSession {
            game_type: GameType::WaterRipples,
            duration: 60,
            sync_window_length: 0,
            sync_tolerance: 0,
            is_warmup: true,
        };
        assert!(sessions.create(&lobby_id, ripples).is_ok());
        assert!(
            sessions
                .create("NOPE0", wine_glasses(60))
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_removing_only_session_clears_flag() {
        let (_registry, lobbies, sessions) = setup();
        let lobby_id = lobbies.create(GameType::WineGlasses);
        let session = sessions.create(&lobby_id, wine_glasses(60)).unwrap();
        assert!(lobbies.get(&lobby_id).unwrap().has_sessions);

        sessions.remove(&lobby_id, session.session_id).unwrap();
        let lobby = lobbies.get(&lobby_id).unwrap();
        assert!(!lobby.has_sessions);
        assert!(lobby.current_session.is_none());

        assert!(
            sessions
                .remove(&lobby_id, session.session_id)
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_removed_session_never_returns() {
        let (_registry, lobbies, sessions) = setup();
        let lobby_id = lobbies.create(GameType::WineGlasses);
        let a = sessions.create(&lobby_id, wine_glasses(10)).unwrap();
        let b = sessions.create(&lobby_id, wine_glasses(20)).unwrap();

        sessions.remove(&lobby_id, a.session_id).unwrap();
        let c = sessions.create(&lobby_id, wine_glasses(30)).unwrap();
        assert_ne!(c.session_id, a.session_id);

        let ids: Vec<_> = sessions
            .get(&lobby_id)
            .unwrap()
            .iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, vec![b.session_id, c.session_id]);
        // Removing the head promotes the next session
        assert_eq!(lobbies.get(&lobby_id).unwrap().current_session, Some(b));
    }

    #[test]
    fn test_reorder() {
        let (_registry, lobbies, sessions) = setup();
        let lobby_id = lobbies.create(GameType::WineGlasses);
        let a = sessions.create(&lobby_id, wine_glasses(10)).unwrap();
        let b = sessions.create(&lobby_id, wine_glasses(20)).unwrap();
        let c = sessions.create(&lobby_id, wine_glasses(30)).unwrap();

        let order = [c.session_id, a.session_id, b.session_id];
        let reordered = sessions.reorder(&lobby_id, &order).unwrap();
        let ids: Vec<_> = reordered.iter().map(|s| s.session_id).collect();
        assert_eq!(ids, order);
        assert_eq!(lobbies.get(&lobby_id).unwrap().current_session, Some(c.clone()));

        for bad in [
            vec![a.session_id, b.session_id],
            vec![a.session_id, b.session_id, b.session_id],
            vec![a.session_id, b.session_id, c.session_id, 999],
        ] {
            assert!(matches!(
                sessions.reorder(&lobby_id, &bad),
                Err(ServerError::InvalidArgument(_))
            ));
        }
        assert_eq!(sessions.len(&lobby_id), 3);
    }

    #[test]
    fn test_queue_dropped_with_lobby() {
        let (_registry, lobbies, sessions) = setup();
        let lobby_id = lobbies.create(GameType::WineGlasses);
        sessions.create(&lobby_id, wine_glasses(10)).unwrap();
        lobbies.remove(&lobby_id).unwrap();
        assert_eq!(sessions.len(&lobby_id), 0);
        assert!(sessions.first(&lobby_id).is_none());
    }
}
