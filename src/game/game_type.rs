use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameType {
    WaterRipples,
    WineGlasses,
}

pub struct GameTypeData {
    /// Whether sessions of this type need a sync window and tolerance.
    pub requires_sync: bool,
    pub default_duration: u64,
    pub default_sync_window_length: u64,
    pub default_sync_tolerance: u64,
}

impl GameType {
    pub fn get_data(&self) -> &GameTypeData {
        match self {
            GameType::WaterRipples => &WATER_RIPPLES_DATA,
            GameType::WineGlasses => &WINE_GLASSES_DATA,
        }
    }

    pub fn requires_sync(&self) -> bool {
        self.get_data().requires_sync
    }
}

// Free-form rippling; each player only sees the partner's input
static WATER_RIPPLES_DATA: LazyLock<GameTypeData> = LazyLock::new(|| GameTypeData {
    requires_sync: false,
    default_duration: 60,
    default_sync_window_length: 0,
    default_sync_tolerance: 0,
});

// Glasses ring only when both players stroke within the tolerance
static WINE_GLASSES_DATA: LazyLock<GameTypeData> = LazyLock::new(|| GameTypeData {
    requires_sync: true,
    default_duration: 60,
    default_sync_window_length: 1000,
    default_sync_tolerance: 100,
});

impl std::str::FromStr for GameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WATER_RIPPLES" => Ok(GameType::WaterRipples),
            "WINE_GLASSES" => Ok(GameType::WineGlasses),
            _ => Err(format!("Unknown game type: {}", s)),
        }
    }
}

impl std::fmt::Display for GameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GameType::WaterRipples => write!(f, "WATER_RIPPLES"),
            GameType::WineGlasses => write!(f, "WINE_GLASSES"),
        }
    }
}
