//! Replays a decrypted packet stream against the entity store, routing
//! property changes and method calls to the session's handlers.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use nom::number::complete::le_u8;
use tracing::{Level, debug, error, span, trace};

use crate::analyzer::Analyzer;
use crate::analyzer::battle_controller::ReplayListener;
use crate::entity::{Binding, DispatchTable, Entity};
use crate::error::{Error, ErrorCategory, ErrorKind};
use crate::nested_property_path::apply_nested_update;
use crate::packet2::{Packet, PacketTable, PacketType, Parser};
use crate::rpc::entitydefs::Definitions;
use crate::types::EntityId;

/// Entity type created for the recording player.
const AVATAR: &str = "Avatar";

/// One decode session: schema, handlers, live entities and the listener
/// that turns them into a timeline.
pub struct ReplayPlayer<C> {
    definitions: Definitions,
    dispatch: DispatchTable<C>,
    listener: C,
    entities: HashMap<EntityId, Entity>,
    analyzers: Vec<Box<dyn Analyzer>>,
    strict: bool,
    first_error: Option<String>,
}

impl<C: ReplayListener> ReplayPlayer<C> {
    pub fn new(
        definitions: Definitions,
        bindings: impl IntoIterator<Item = Binding<C>>,
        listener: C,
        strict: bool,
    ) -> Self {
        ReplayPlayer {
            definitions,
            dispatch: DispatchTable::new(bindings),
            listener,
            entities: HashMap::new(),
            analyzers: Vec::new(),
            strict,
            first_error: None,
        }
    }

    /// Analyzers see every decoded packet before it is applied.
    pub fn add_analyzer(&mut self, analyzer: Box<dyn Analyzer>) {
        self.analyzers.push(analyzer);
    }

    pub fn listener(&self) -> &C {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut C {
        &mut self.listener
    }

    pub fn entities(&self) -> &HashMap<EntityId, Entity> {
        &self.entities
    }

    /// The first live entity of the given type.
    pub fn entity_of_type(&self, type_name: &str) -> Option<&Entity> {
        self.entities
            .values()
            .filter(|entity| entity.type_name() == type_name)
            .min_by_key(|entity| entity.id())
    }

    /// Description of the first recoverable failure, if any packet was dropped.
    pub fn first_error(&self) -> Option<&str> {
        self.first_error.as_deref()
    }

    /// Applies every packet of `stream` in order. Returns the first fatal
    /// error; recoverable ones only drop the packet they occurred in.
    pub fn play(&mut self, stream: &[u8], table: PacketTable) -> Result<(), ErrorKind> {
        let mut parser = Parser::new(stream, table);
        while let Some(packet) = parser.next_packet() {
            let result = packet.and_then(|packet| {
                for analyzer in self.analyzers.iter_mut() {
                    analyzer.process(&packet);
                }
                self.process(&packet).map_err(|err| ErrorKind::Packet {
                    clock: packet.clock.seconds(),
                    packet_type: packet.packet_type,
                    source: Box::new(err),
                })
            });

            if let Err(err) = result {
                self.record(err)?;
            }
        }

        for analyzer in self.analyzers.iter_mut() {
            analyzer.finish();
        }
        Ok(())
    }

    fn record(&mut self, err: ErrorKind) -> Result<(), ErrorKind> {
        if err.is_fatal(self.strict) {
            error!("{}", error_chain(&err));
            return Err(err);
        }
        match err.category() {
            ErrorCategory::Semantic => debug!("{}", error_chain(&err)),
            _ => {
                error!("{}", error_chain(&err));
                if self.first_error.is_none() {
                    self.first_error = Some(error_chain(&err));
                }
            }
        }
        Ok(())
    }

    /// Applies one packet.
    pub fn process(&mut self, packet: &Packet<'_>) -> Result<(), ErrorKind> {
        let span = span!(Level::TRACE, "packet", clock = packet.clock.seconds(), tag = packet.packet_type);
        let _enter = span.enter();

        let ReplayPlayer {
            definitions,
            dispatch,
            listener,
            entities,
            ..
        } = self;

        listener.set_clock(packet.clock);

        match &packet.payload {
            PacketType::BasePlayerCreate(create) => {
                let avatar = avatar_entry(entities, definitions, create.entity_id)?;
                // base properties are sent in declaration order
                let mut i = create.state;
                for index in 0..avatar.def().base_properties().len() {
                    i = avatar.set_base_property(index, i)?.0;
                }
                debug!("base player {} created", create.entity_id);
                listener.on_entity_create(avatar)?;
                listener.on_player_enter_world(create.entity_id);
            }
            PacketType::CellPlayerCreate(create) => {
                let avatar = avatar_entry(entities, definitions, create.entity_id)?;
                avatar.position = create.position;
                let mut i = create.state;
                // stored without notifying handlers
                for index in 0..avatar.def().client_properties_internal().len() {
                    i = avatar.set_client_property_internal(index, i)?.0;
                }
                debug!("cell player {} created", create.entity_id);
                listener.on_entity_create(avatar)?;
            }
            PacketType::EntityControl(control) => {
                trace!("entity {} controlled: {}", control.entity_id, control.is_controlled);
            }
            PacketType::EntityEnter(enter) => {
                entities
                    .get_mut(&enter.entity_id)
                    .ok_or(ErrorKind::UnknownEntity(enter.entity_id))?
                    .set_in_aoi(true);
            }
            PacketType::EntityLeave(leave) => {
                listener.on_entity_leave(leave.entity_id);
                entities
                    .get_mut(&leave.entity_id)
                    .ok_or(ErrorKind::UnknownEntity(leave.entity_id))?
                    .set_in_aoi(false);
            }
            PacketType::EntityCreate(create) => {
                let def = definitions.resolve_by_index(create.entity_type as u32)?;
                let mut entity = Entity::new(create.entity_id, def);
                entity.position = create.position;

                let (mut i, count) = le_u8::<_, Error>(create.state)?;
                let mut names = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (rest, index) = le_u8::<_, Error>(i)?;
                    let (rest, name) = entity.set_client_property(index as usize, rest)?;
                    i = rest;
                    names.push(name);
                }
                if !i.is_empty() {
                    return Err(ErrorKind::TrailingBytes(i.len()));
                }

                // handlers only run once the whole packet decoded
                debug!("created {} {}", entity.type_name(), create.entity_id);
                let entity = match entities.entry(create.entity_id) {
                    Entry::Occupied(mut entry) => {
                        debug!("entity {} re-created", create.entity_id);
                        entry.insert(entity);
                        entry.into_mut()
                    }
                    Entry::Vacant(entry) => entry.insert(entity),
                };
                let entity = &*entity;
                for name in &names {
                    fire_property(dispatch, listener, entity, name)?;
                }
                tolerate(listener.on_entity_create(entity))?;
            }
            PacketType::EntityProperty(update) => {
                let entity = entities
                    .get_mut(&update.entity_id)
                    .ok_or(ErrorKind::UnknownEntity(update.entity_id))?;
                let (_, name) = entity.set_client_property(update.message_id as usize, update.payload)?;
                fire_property(dispatch, listener, entity, &name)?;
            }
            PacketType::EntityMethod(call) => {
                let entity = entities
                    .get(&call.entity_id)
                    .ok_or(ErrorKind::UnknownEntity(call.entity_id))?;
                let index = call.message_id as usize;
                let name = entity.client_method_name(index)?;
                if !dispatch.has_method_handlers(entity.type_name(), name) {
                    trace!("{}.{} has no handlers", entity.type_name(), name);
                    return Ok(());
                }

                let method = entity.decode_client_method(index, call.payload)?;
                debug!("{} {}.{}", call.entity_id, entity.type_name(), method.name);
                for handler in dispatch.method_handlers(entity.type_name(), &method.name) {
                    tolerate(handler(listener, entity, &method.args))?;
                }
            }
            PacketType::Position(pos) => {
                entities
                    .get_mut(&pos.entity_id)
                    .ok_or(ErrorKind::UnknownEntity(pos.entity_id))?
                    .set_transform(pos.position, pos.yaw, pos.pitch, pos.roll);
            }
            PacketType::PlayerPosition(pos) => {
                if !pos.entity_id2.is_null() {
                    // entity 1 follows entity 2, e.g. the avatar riding its vehicle
                    let Some(master) = entities.get(&pos.entity_id2).cloned() else {
                        trace!("position master {} not created yet", pos.entity_id2);
                        return Ok(());
                    };
                    if let Some(follower) = entities.get_mut(&pos.entity_id1) {
                        follower.copy_transform(&master);
                    }
                } else if !pos.entity_id1.is_null() {
                    if let Some(entity) = entities.get_mut(&pos.entity_id1) {
                        entity.set_transform(pos.position, pos.yaw, pos.pitch, pos.roll);
                    }
                }
            }
            PacketType::Version(version) => {
                debug!("game version {}", version);
                listener.on_version(version);
            }
            PacketType::Map(map) => {
                debug!("map {} in arena {}", map.name, map.arena_id);
                listener.on_map(map);
            }
            PacketType::NestedProperty(nested) => {
                let entity = entities
                    .get_mut(&nested.entity_id)
                    .ok_or(ErrorKind::UnknownEntity(nested.entity_id))?;
                let Some(cmd) = apply_nested_update(entity, nested.is_slice, nested.payload)? else {
                    trace!("nested update on {} had no effect", nested.entity_id);
                    return Ok(());
                };

                let entity = &*entity;
                let path = cmd.path();
                debug!("{} {} nested {:?}", entity.id(), path, cmd.action);
                let Some(leaf) = cmd.leaf(entity) else {
                    return Ok(());
                };
                for handler in dispatch.nested_handlers(entity.type_name(), &path) {
                    tolerate(handler(listener, entity, leaf))?;
                }
            }
            PacketType::Unknown(_) => {}
        }
        Ok(())
    }

    /// Gives back the listener and the final entity store.
    pub fn into_parts(self) -> (C, HashMap<EntityId, Entity>) {
        (self.listener, self.entities)
    }
}

/// The avatar may be announced by either the base or the cell part first.
fn avatar_entry<'e>(
    entities: &'e mut HashMap<EntityId, Entity>,
    definitions: &Definitions,
    id: EntityId,
) -> Result<&'e mut Entity, ErrorKind> {
    Ok(match entities.entry(id) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(Entity::new(id, definitions.resolve_by_name(AVATAR)?)),
    })
}

fn fire_property<C>(
    dispatch: &DispatchTable<C>,
    listener: &mut C,
    entity: &Entity,
    name: &str,
) -> Result<(), ErrorKind> {
    let handlers = dispatch.property_handlers(entity.type_name(), name);
    if handlers.is_empty() {
        return Ok(());
    }
    let Some(value) = entity.client_property(name) else {
        return Ok(());
    };
    for handler in handlers {
        tolerate(handler(listener, entity, value))?;
    }
    Ok(())
}

/// A handler that hits a Semantic error is skipped; the remaining handlers
/// and the rest of the packet still apply.
fn tolerate(result: Result<(), ErrorKind>) -> Result<(), ErrorKind> {
    match result {
        Err(err) if err.category() == ErrorCategory::Semantic => {
            debug!("handler skipped: {}", error_chain(&err));
            Ok(())
        }
        other => other,
    }
}

/// `outer: inner: ...` for errors wrapping a source.
pub(crate) fn error_chain(err: &ErrorKind) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::PropertyHandler;
    use crate::packet2::tests::frame;
    use crate::rpc::entitydefs::tests::memory_loader;
    use crate::rpc::typedefs::ArgValue;

    const FILES: &[(&str, &str)] = &[
        ("scripts/entity_defs/alias.xml", "<root/>"),
        (
            "scripts/entities.xml",
            "<root><ClientServerEntities><Avatar/></ClientServerEntities></root>",
        ),
        (
            "scripts/entity_defs/Avatar.def",
            r#"<root>
                <Properties>
                    <teamId><Type>UINT8</Type><Flags>OWN_CLIENT</Flags></teamId>
                </Properties>
            </root>"#,
        ),
    ];

    #[derive(Default)]
    struct Seen {
        teams: Vec<i64>,
    }

    impl ReplayListener for Seen {}

    fn on_team(seen: &mut Seen, _: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
        seen.teams.push(value.as_i64().unwrap_or(-1));
        Ok(())
    }

    fn no_roster_record(_: &mut Seen, entity: &Entity, _: &ArgValue) -> Result<(), ErrorKind> {
        Err(ErrorKind::MissingRecord {
            table: "player_info",
            id: entity.id().raw() as i64,
        })
    }

    fn player(strict: bool) -> ReplayPlayer<Seen> {
        let definitions = Definitions::load(&memory_loader(FILES), "").unwrap();
        let bindings: Vec<Binding<Seen>> = vec![
            Binding::Property {
                entity_type: "Avatar",
                property: "teamId",
                handler: no_roster_record as PropertyHandler<Seen>,
            },
            Binding::Property {
                entity_type: "Avatar",
                property: "teamId",
                handler: on_team,
            },
        ];
        ReplayPlayer::new(definitions, bindings, Seen::default(), strict)
    }

    fn cell_player_create(id: i32, team: u8) -> Vec<u8> {
        let mut payload = id.to_le_bytes().to_vec();
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&[0u8; 24]);
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.push(team);
        payload
    }

    fn property_update(id: u32, index: u32, value: &[u8]) -> Vec<u8> {
        let mut payload = id.to_le_bytes().to_vec();
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(value);
        payload
    }

    #[test]
    fn cell_player_state_does_not_notify() {
        let mut stream = Vec::new();
        frame(&mut stream, 0x01, 0.1, &cell_player_create(100, 3));

        let mut player = player(true);
        player.play(&stream, PacketTable::Since12_6).unwrap();
        let avatar = &player.entities()[&EntityId(100)];
        assert_eq!(avatar.client_property("teamId").and_then(ArgValue::as_i64), Some(3));
        assert!(player.listener().teams.is_empty());
    }

    #[test]
    fn semantic_handler_error_skips_only_that_handler() {
        let mut stream = Vec::new();
        frame(&mut stream, 0x01, 0.1, &cell_player_create(100, 3));
        frame(&mut stream, 0x07, 0.2, &property_update(100, 0, &[4]));

        let mut player = player(true);
        player.play(&stream, PacketTable::Since12_6).unwrap();
        assert_eq!(player.listener().teams, [4]);
        assert_eq!(player.first_error(), None);
    }
}
