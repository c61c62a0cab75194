pub mod game_type;
pub mod instance;
pub mod manager;
pub mod result;
pub mod sync;

pub use game_type::GameType;
pub use manager::{GameManager, GameTerminationHandler};
pub use result::{LogResultSink, ResultSink};
