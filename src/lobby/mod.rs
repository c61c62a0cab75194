pub mod broadcaster;
pub mod lobby;
pub mod manager;

pub use lobby::LobbyId;
pub use manager::{LobbyManager, LobbyObserver};
