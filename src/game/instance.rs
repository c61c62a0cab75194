use super::GameType;
use super::sync::{SyncStrategy, TimestampDeltaStrategy};
use crate::{
    data_channel::DataSender,
    error::{ServerError, ServerResult},
    messages::{DataCodec, DataMessage, DataMessageType},
    registry::{ClientId, ClientRegistry},
    session::SessionDescriptor,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Everything a running game needs to talk to its two players.
pub struct GameContext {
    pub lobby_id: String,
    pub players: [ClientId; 2],
    pub session: SessionDescriptor,
    pub start_time_ms: i64,
    pub registry: Arc<ClientRegistry>,
    pub data: DataSender,
}

impl GameContext {
    /// Sends to one player at whatever data address they hold now. A player
    /// without one is skipped.
    fn send_to(&self, index: usize, message: &DataMessage, codec: DataCodec) {
        let player = &self.players[index];
        match self.registry.data_address(player) {
            Some(addr) => {
                self.data.send(addr, message, codec);
            }
            None => debug!(
                "Player {} in lobby {} has no data address, dropping {:?}",
                player, self.lobby_id, message.kind
            ),
        }
    }

    /// Forwards an action to the other player, stamped with its sender.
    fn relay(&self, from: usize, action: &DataMessage, codec: DataCodec) {
        let forwarded = action.clone().with_actor(self.players[from].clone());
        self.send_to(1 - from, &forwarded, codec);
    }
}

/// Per-game-type behaviour for player actions.
pub trait GameInstance: Send + Sync {
    /// `from` is the acting player's index in the game's player pair.
    fn handle_action(
        &self,
        from: usize,
        action: &DataMessage,
        codec: DataCodec,
    ) -> ServerResult<()>;
}

/// Free-form play: every input is mirrored to the partner.
pub struct RelayGame {
    ctx: GameContext,
}

impl GameInstance for RelayGame {
    fn handle_action(
        &self,
        from: usize,
        action: &DataMessage,
        codec: DataCodec,
    ) -> ServerResult<()> {
        check_action(from, action)?;
        self.ctx.relay(from, action, codec);
        Ok(())
    }
}

/// Mirrors inputs like [`RelayGame`] and additionally tells both players
/// whenever they acted in sync.
pub struct SyncGame {
    ctx: GameContext,
    strategy: Mutex<Box<dyn SyncStrategy>>,
}

impl GameInstance for SyncGame {
    fn handle_action(
        &self,
        from: usize,
        action: &DataMessage,
        codec: DataCodec,
    ) -> ServerResult<()> {
        check_action(from, action)?;
        self.ctx.relay(from, action, codec);

        let event = self.strategy.lock().observe(from, action.timestamp);
        if let Some(event) = event {
            debug!(
                "Players in lobby {} synced in window {} (skew {} ms)",
                self.ctx.lobby_id, event.window, event.skew_ms
            );
            let sync = DataMessage::new(DataMessageType::Sync)
                .with_timestamp(action.timestamp)
                .with_data(json!({ "window": event.window, "skewMs": event.skew_ms }));
            self.ctx.send_to(0, &sync, codec);
            self.ctx.send_to(1, &sync, codec);
        }
        Ok(())
    }
}

fn check_action(from: usize, action: &DataMessage) -> ServerResult<()> {
    if from > 1 {
        return Err(ServerError::Internal(format!("player index {}", from)));
    }
    if action.kind != DataMessageType::UserInput {
        return Err(ServerError::Protocol(format!(
            "{:?} is not a game action",
            action.kind
        )));
    }
    Ok(())
}

/// Builds the instance for the session's game type.
pub fn create_instance(ctx: GameContext) -> Box<dyn GameInstance> {
    match ctx.session.game_type {
        GameType::WaterRipples => Box::new(RelayGame { ctx }),
        GameType::WineGlasses => {
            let strategy = TimestampDeltaStrategy::new(
                ctx.start_time_ms,
                ctx.session.sync_window_length,
                ctx.session.sync_tolerance,
            );
            Box::new(SyncGame {
                ctx,
                strategy: Mutex::new(Box::new(strategy)),
            })
        }
    }
}
