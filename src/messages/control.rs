use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ServerError;
use crate::game::GameType;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Connection
    Enter,
    EnterWithId,
    Reconnect,
    Heartbeat,
    Exit,
    Ping,
    Pong,

    // Replies
    Success,
    Error,

    // Manager requests
    CreateLobby,
    JoinLobby,
    LeaveLobby,
    RemoveLobby,
    ToggleReady,
    CreateSession,
    RemoveSession,
    ChangeSessionsOrder,
    GetSessions,
    GetLobbies,
    GetPlayers,
    StartGame,
    EndGame,
    StartExperiment,
    StopExperiment,

    // Pushed to players
    JoinedLobby,
    LeftLobby,
    LobbyUpdate,
    ConfigureGame,
    NoSessions,
    ReconnectToGame,
}

/// Fields a request must carry, keyed by request type. Types missing from
/// the table have no requirements.
static REQUIRED_FIELDS: Lazy<HashMap<MessageType, &'static [&'static str]>> = Lazy::new(|| {
    use MessageType::*;
    HashMap::from([
        (EnterWithId, &["playerId"][..]),
        (Reconnect, &["playerId"][..]),
        (CreateLobby, &["gameType"][..]),
        (JoinLobby, &["lobbyId", "playerId"][..]),
        (LeaveLobby, &["lobbyId", "playerId"][..]),
        (RemoveLobby, &["lobbyId"][..]),
        (ToggleReady, &["playerId"][..]),
        (
            CreateSession,
            &["lobbyId", "duration", "gameType", "syncWindowLength", "syncTolerance"][..],
        ),
        (RemoveSession, &["lobbyId", "sessionId"][..]),
        (ChangeSessionsOrder, &["lobbyId", "sessionIds"][..]),
        (GetSessions, &["lobbyId"][..]),
        (StartGame, &["lobbyId", "sessionId"][..]),
        (EndGame, &["lobbyId"][..]),
        (StartExperiment, &["lobbyId"][..]),
        (StopExperiment, &["lobbyId"][..]),
    ])
});

/// A control-channel message. The same shape travels in both directions;
/// which optional fields are meaningful depends on `kind`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lobby_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_type: Option<GameType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_window_length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_tolerance: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_warmup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ids: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ControlMessage {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            player_id: None,
            lobby_id: None,
            game_type: None,
            duration: None,
            sync_window_length: None,
            sync_tolerance: None,
            is_warmup: None,
            session_id: None,
            session_ids: None,
            message: None,
            data: None,
            timestamp: None,
        }
    }

    pub fn from_json(line: &str) -> Result<Self, ServerError> {
        serde_json::from_str(line).map_err(|e| ServerError::Protocol(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"ERROR","message":"Serialization failed"}"#.to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MessageType::Error).with_message(message)
    }

    pub fn success() -> Self {
        Self::new(MessageType::Success)
    }

    pub fn with_player(mut self, player_id: impl Into<String>) -> Self {
        self.player_id = Some(player_id.into());
        self
    }

    pub fn with_lobby(mut self, lobby_id: impl Into<String>) -> Self {
        self.lobby_id = Some(lobby_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Vec<Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn has_field(&self, name: &str) -> bool {
        match name {
            "playerId" => self.player_id.is_some(),
            "lobbyId" => self.lobby_id.is_some(),
            "gameType" => self.game_type.is_some(),
            "duration" => self.duration.is_some(),
            "syncWindowLength" => self.sync_window_length.is_some(),
            "syncTolerance" => self.sync_tolerance.is_some(),
            "isWarmup" => self.is_warmup.is_some(),
            "sessionId" => self.session_id.is_some(),
            "sessionIds" => self.session_ids.is_some(),
            "message" => self.message.is_some(),
            "data" => self.data.is_some(),
            "timestamp" => self.timestamp.is_some(),
            _ => false,
        }
    }

    pub fn required_fields(kind: MessageType) -> &'static [&'static str] {
        REQUIRED_FIELDS.get(&kind).copied().unwrap_or(&[])
    }

    /// Fails with every required field this message lacks for its type.
    pub fn validate(&self) -> Result<(), ServerError> {
        let missing: Vec<&'static str> = Self::required_fields(self.kind)
            .iter()
            .copied()
            .filter(|name| !self.has_field(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ServerError::MissingFields(missing))
        }
    }

    // Accessors for fields `validate` has already vouched for.

    pub fn lobby(&self) -> Result<&str, ServerError> {
        self.lobby_id
            .as_deref()
            .ok_or(ServerError::MissingFields(vec!["lobbyId"]))
    }

    pub fn player(&self) -> Result<&str, ServerError> {
        self.player_id
            .as_deref()
            .ok_or(ServerError::MissingFields(vec!["playerId"]))
    }

    pub fn session(&self) -> Result<u64, ServerError> {
        self.session_id
            .ok_or(ServerError::MissingFields(vec!["sessionId"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_session() {
        let msg = ControlMessage::from_json(
            r#"{"type":"CREATE_SESSION","lobbyId":"AB12C","gameType":"WINE_GLASSES","duration":60,"syncWindowLength":1000,"syncTolerance":100}"#,
        )
        .unwrap();
        assert_eq!(msg.kind, MessageType::CreateSession);
        assert_eq!(msg.game_type, Some(GameType::WineGlasses));
        assert_eq!(msg.sync_window_length, Some(1000));
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_missing_fields_are_all_named() {
        let msg = ControlMessage::from_json(r#"{"type":"CREATE_SESSION","gameType":"WATER_RIPPLES"}"#)
            .unwrap();
        assert_eq!(
            msg.validate(),
            Err(ServerError::MissingFields(vec![
                "lobbyId",
                "duration",
                "syncWindowLength",
                "syncTolerance"
            ]))
        );
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = ControlMessage::from_json(r#"{"type":"DANCE"}"#).unwrap_err();
        assert!(matches!(err, ServerError::Protocol(_)));
        let err = ControlMessage::from_json("not json").unwrap_err();
        assert!(matches!(err, ServerError::Protocol(_)));
    }

    #[test]
    fn test_serialization_skips_absent_fields() {
        let json = ControlMessage::error("boom").to_json();
        assert_eq!(json, r#"{"type":"ERROR","message":"boom"}"#);
    }

    #[test]
    fn test_requests_without_requirements_validate() {
        assert!(ControlMessage::new(MessageType::GetLobbies).validate().is_ok());
        assert!(ControlMessage::new(MessageType::Ping).validate().is_ok());
    }
}
