use crate::messages::ControlMessage;
use crate::registry::{ClientId, ClientRegistry};
use std::sync::Arc;

/// Fans control messages out to lobby members through the registry, so a
/// reconnected player is always reached on their current connection.
#[derive(Clone)]
pub struct LobbyBroadcaster {
    registry: Arc<ClientRegistry>,
}

impl LobbyBroadcaster {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub fn send_to(&self, player_id: &str, response: ControlMessage) {
        self.registry.send(player_id, response);
    }

    /// Sends one shared copy of `response` to every listed player.
    pub fn broadcast(&self, players: &[ClientId], response: ControlMessage) {
        let message = Arc::new(response);
        for player_id in players {
            self.registry.send_shared(player_id, Arc::clone(&message));
        }
    }
}
