use super::GameType;
use crate::registry::ClientId;
use crate::session::SessionId;
use serde::Serialize;
use tracing::info;

/// What happened in one finished game.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutcome {
    pub lobby_id: String,
    pub session_id: SessionId,
    pub experiment_id: Option<String>,
    pub game_type: GameType,
    pub players: [ClientId; 2],
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub error: Option<String>,
}

pub trait ResultSink: Send + Sync {
    fn record(&self, outcome: &SessionOutcome);
}

/// Writes outcomes to the log as JSON.
pub struct LogResultSink;

impl ResultSink for LogResultSink {
    fn record(&self, outcome: &SessionOutcome) {
        match serde_json::to_string(outcome) {
            Ok(json) => info!(target: "results", "{}", json),
            Err(e) => info!(target: "results", "{:?} (unserializable: {})", outcome, e),
        }
    }
}
