mod controller;
pub mod listener;
pub mod players;
pub mod state;
pub mod timeline;

pub use controller::{BattleController, BattleStage};
pub use listener::ReplayListener;
pub use players::PlayersInfo;
pub use timeline::{BattleResult, DeathInfo, Events, TaskInfo, Timeline};
