use crate::entity::Entity;
use crate::error::ErrorKind;
use crate::packet2::MapPacket;
use crate::types::{EntityId, GameClock};

/// Receives the lifecycle events the replay player sees that are not routed
/// through the dispatch table.
pub trait ReplayListener {
    /// Called before each packet is processed.
    fn set_clock(&mut self, _clock: GameClock) {}

    /// Game version as sent in the `Version` packet, e.g. `13,0,0,7851390`.
    fn on_version(&mut self, _version: &str) {}

    fn on_map(&mut self, _map: &MapPacket) {}

    /// The avatar created by `BasePlayerCreate`.
    fn on_player_enter_world(&mut self, _entity_id: EntityId) {}

    /// Called once the initial properties of a created entity are decoded.
    fn on_entity_create(&mut self, _entity: &Entity) -> Result<(), ErrorKind> {
        Ok(())
    }

    fn on_entity_leave(&mut self, _entity_id: EntityId) {}
}
