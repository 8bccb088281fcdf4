pub mod analyzer;
pub mod entity;
mod error;
pub mod game_constants;
pub mod nested_property_path;
pub mod packet2;
pub mod player;
pub mod rpc;
pub mod session;
pub mod types;
pub mod unpack;
pub mod versions;
mod wowsreplay;

pub use error::*;
pub use session::{DecodeOptions, DecodeOptionsBuilder, DecodeSession, ReplayInfo, decode_replay};
pub use strum;
pub use wowsreplay::*;

#[cfg(feature = "arc")]
pub type Rc<T> = std::sync::Arc<T>;

#[cfg(not(feature = "arc"))]
pub type Rc<T> = std::rc::Rc<T>;
