#[allow(clippy::module_inception)]
pub mod analyzer;
pub mod battle_controller;
pub mod packet_dump;

pub use analyzer::*;
