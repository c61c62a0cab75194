mod control;
mod data;

pub use self::control::*;
pub use self::data::*;
