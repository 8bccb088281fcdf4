use kinded::Kinded;
use nom::{
    bytes::complete::take,
    multi::length_data,
    number::complete::{le_f32, le_i16, le_i32, le_i64, le_i8, le_u32, le_u8},
    sequence::tuple,
};
use serde::Serialize;
use tracing::{info, trace};

use crate::error::{Error, ErrorKind};
use crate::types::{EntityId, GameClock, Vec3, Version};
use crate::IResult;

#[derive(Debug, Serialize)]
pub struct BasePlayerCreatePacket<'a> {
    pub entity_id: EntityId,
    pub entity_type: i16,
    /// Base properties in declaration order
    pub state: &'a [u8],
}

#[derive(Debug, Serialize)]
pub struct CellPlayerCreatePacket<'a> {
    pub entity_id: EntityId,
    pub space_id: i32,
    pub vehicle_id: EntityId,
    pub position: Vec3,
    pub direction: Vec3,
    /// Internal client properties in declaration order
    pub state: &'a [u8],
}

#[derive(Debug, Serialize)]
pub struct EntityControlPacket {
    pub entity_id: EntityId,
    pub is_controlled: bool,
}

#[derive(Debug, Serialize)]
pub struct EntityEnterPacket {
    pub entity_id: EntityId,
    pub space_id: i32,
    pub vehicle_id: EntityId,
}

#[derive(Debug, Serialize)]
pub struct EntityLeavePacket {
    pub entity_id: EntityId,
}

#[derive(Debug, Serialize)]
pub struct EntityCreatePacket<'a> {
    pub entity_id: EntityId,
    /// 1-based index into the entity types of `entities.xml`
    pub entity_type: i16,
    pub vehicle_id: EntityId,
    pub space_id: i32,
    pub position: Vec3,
    pub direction: Vec3,
    /// `u8` count followed by `(u8 index, value)` pairs
    pub state: &'a [u8],
}

#[derive(Debug, Serialize)]
pub struct EntityPropertyPacket<'a> {
    pub entity_id: EntityId,
    pub message_id: u32,
    pub payload: &'a [u8],
}

#[derive(Debug, Serialize)]
pub struct EntityMethodPacket<'a> {
    pub entity_id: EntityId,
    pub message_id: u32,
    pub payload: &'a [u8],
}

#[derive(Debug, Serialize)]
pub struct PositionPacket {
    pub entity_id: EntityId,
    pub vehicle_id: EntityId,
    pub position: Vec3,
    pub position_error: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    pub is_error: bool,
}

#[derive(Debug, Serialize)]
pub struct PlayerPositionPacket {
    pub entity_id1: EntityId,
    /// When non-zero, `entity_id1` takes this entity's transform
    pub entity_id2: EntityId,
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
}

#[derive(Debug, Serialize)]
pub struct MapPacket {
    pub space_id: i32,
    pub arena_id: i64,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct NestedPropertyPacket<'a> {
    pub entity_id: EntityId,
    pub is_slice: bool,
    pub payload_size: u8,
    pub payload: &'a [u8],
}

#[derive(Debug, Serialize, Kinded)]
#[kinded(derive(Serialize, Hash))]
pub enum PacketType<'a> {
    BasePlayerCreate(BasePlayerCreatePacket<'a>),
    CellPlayerCreate(CellPlayerCreatePacket<'a>),
    EntityControl(EntityControlPacket),
    EntityEnter(EntityEnterPacket),
    EntityLeave(EntityLeavePacket),
    EntityCreate(EntityCreatePacket<'a>),
    EntityProperty(EntityPropertyPacket<'a>),
    EntityMethod(EntityMethodPacket<'a>),
    Position(PositionPacket),
    PlayerPosition(PlayerPositionPacket),
    Version(String),
    Map(MapPacket),
    NestedProperty(NestedPropertyPacket<'a>),
    Unknown(&'a [u8]),
}

#[derive(Debug, Serialize)]
pub struct Packet<'a> {
    pub packet_size: u32,
    pub packet_type: u32,
    pub clock: GameClock,
    pub payload: PacketType<'a>,
    #[serde(skip)]
    pub raw: &'a [u8],
}

/// Tag numbering of the packet stream. Some tags moved in 12.6.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PacketTable {
    Legacy,
    Since12_6,
}

impl PacketTable {
    pub const RENUMBERED_IN: Version = Version::new(12, 6, 0, 0);

    pub fn for_version(version: &Version) -> Self {
        if version.is_at_least(&Self::RENUMBERED_IN) {
            PacketTable::Since12_6
        } else {
            PacketTable::Legacy
        }
    }

    pub fn kind(self, packet_type: u32) -> Option<PacketTypeKind> {
        let kind = match packet_type {
            0x00 => PacketTypeKind::BasePlayerCreate,
            0x01 => PacketTypeKind::CellPlayerCreate,
            0x02 => PacketTypeKind::EntityControl,
            0x03 => PacketTypeKind::EntityEnter,
            0x04 => PacketTypeKind::EntityLeave,
            0x05 => PacketTypeKind::EntityCreate,
            0x07 => PacketTypeKind::EntityProperty,
            0x08 => PacketTypeKind::EntityMethod,
            0x0a => PacketTypeKind::Position,
            0x16 => PacketTypeKind::Version,
            other => match (self, other) {
                (PacketTable::Legacy, 0x22) | (PacketTable::Since12_6, 0x23) => {
                    PacketTypeKind::NestedProperty
                }
                (PacketTable::Legacy, 0x27) | (PacketTable::Since12_6, 0x28) => {
                    PacketTypeKind::Map
                }
                (PacketTable::Legacy, 0x2b) | (PacketTable::Since12_6, 0x2c) => {
                    PacketTypeKind::PlayerPosition
                }
                _ => return None,
            },
        };
        Some(kind)
    }
}

fn parse_entity_id(i: &[u8]) -> IResult<&[u8], EntityId> {
    let (i, id) = le_i32(i)?;
    Ok((i, EntityId::from(id)))
}

fn parse_unsigned_entity_id(i: &[u8]) -> IResult<&[u8], EntityId> {
    let (i, id) = le_u32(i)?;
    Ok((i, EntityId::from(id)))
}

fn vec3(i: &[u8]) -> IResult<&[u8], Vec3> {
    let (i, v) = tuple((le_f32, le_f32, le_f32))(i)?;
    Ok((i, Vec3::from(v)))
}

fn blob(i: &[u8]) -> IResult<&[u8], &[u8]> {
    length_data(le_u32)(i)
}

fn parse_base_player_create(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_entity_id(i)?;
    let (i, entity_type) = le_i16(i)?;
    let (i, state) = blob(i)?;
    Ok((
        i,
        PacketType::BasePlayerCreate(BasePlayerCreatePacket {
            entity_id,
            entity_type,
            state,
        }),
    ))
}

fn parse_cell_player_create(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_entity_id(i)?;
    let (i, space_id) = le_i32(i)?;
    let (i, vehicle_id) = parse_entity_id(i)?;
    let (i, position) = vec3(i)?;
    let (i, direction) = vec3(i)?;
    let (i, state) = blob(i)?;
    Ok((
        i,
        PacketType::CellPlayerCreate(CellPlayerCreatePacket {
            entity_id,
            space_id,
            vehicle_id,
            position,
            direction,
            state,
        }),
    ))
}

fn parse_entity_control(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_entity_id(i)?;
    let (i, is_controlled) = le_i8(i)?;
    Ok((
        i,
        PacketType::EntityControl(EntityControlPacket {
            entity_id,
            is_controlled: is_controlled != 0,
        }),
    ))
}

fn parse_entity_enter(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_entity_id(i)?;
    let (i, space_id) = le_i32(i)?;
    let (i, vehicle_id) = parse_entity_id(i)?;
    Ok((
        i,
        PacketType::EntityEnter(EntityEnterPacket {
            entity_id,
            space_id,
            vehicle_id,
        }),
    ))
}

fn parse_entity_leave(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_entity_id(i)?;
    Ok((i, PacketType::EntityLeave(EntityLeavePacket { entity_id })))
}

fn parse_entity_create(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_entity_id(i)?;
    let (i, entity_type) = le_i16(i)?;
    let (i, vehicle_id) = parse_entity_id(i)?;
    let (i, space_id) = le_i32(i)?;
    let (i, position) = vec3(i)?;
    let (i, direction) = vec3(i)?;
    let (i, state) = blob(i)?;
    Ok((
        i,
        PacketType::EntityCreate(EntityCreatePacket {
            entity_id,
            entity_type,
            vehicle_id,
            space_id,
            position,
            direction,
            state,
        }),
    ))
}

fn parse_entity_property(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_unsigned_entity_id(i)?;
    let (i, message_id) = le_u32(i)?;
    let (i, payload) = blob(i)?;
    Ok((
        i,
        PacketType::EntityProperty(EntityPropertyPacket {
            entity_id,
            message_id,
            payload,
        }),
    ))
}

fn parse_entity_method(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_unsigned_entity_id(i)?;
    let (i, message_id) = le_u32(i)?;
    let (i, payload) = blob(i)?;
    Ok((
        i,
        PacketType::EntityMethod(EntityMethodPacket {
            entity_id,
            message_id,
            payload,
        }),
    ))
}

fn parse_position(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_entity_id(i)?;
    let (i, vehicle_id) = parse_entity_id(i)?;
    let (i, position) = vec3(i)?;
    let (i, position_error) = vec3(i)?;
    let (i, (yaw, pitch, roll)) = tuple((le_f32, le_f32, le_f32))(i)?;
    let (i, is_error) = le_i8(i)?;
    Ok((
        i,
        PacketType::Position(PositionPacket {
            entity_id,
            vehicle_id,
            position,
            position_error,
            yaw,
            pitch,
            roll,
            is_error: is_error != 0,
        }),
    ))
}

fn parse_player_position(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id1) = parse_entity_id(i)?;
    let (i, entity_id2) = parse_entity_id(i)?;
    let (i, position) = vec3(i)?;
    let (i, (yaw, pitch, roll)) = tuple((le_f32, le_f32, le_f32))(i)?;
    Ok((
        i,
        PacketType::PlayerPosition(PlayerPositionPacket {
            entity_id1,
            entity_id2,
            position,
            yaw,
            pitch,
            roll,
        }),
    ))
}

fn utf8(bytes: &[u8]) -> Result<String, nom::Err<Error>> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|err| nom::Err::Failure(Error::from(ErrorKind::from(err))))
}

fn parse_version(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, len) = le_i32(i)?;
    let (i, version) = take(len.max(0) as usize)(i)?;
    Ok((i, PacketType::Version(utf8(version)?)))
}

fn parse_map(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let total = i.len();
    let (i, space_id) = le_i32(i)?;
    let (i, arena_id) = le_i64(i)?;
    let (i, name_size) = le_i32(i)?;

    // Newer clients put a 132 byte block before the actual name
    let pos = total - i.len();
    let (i, name_size) = if pos as i64 + name_size as i64 + 64 != total as i64 - 1 {
        let (i, _) = take(132usize)(i)?;
        le_i32(i)?
    } else {
        (i, name_size)
    };
    let (i, name) = take(name_size.max(0) as usize)(i)?;

    Ok((
        i,
        PacketType::Map(MapPacket {
            space_id,
            arena_id,
            name: utf8(name)?,
        }),
    ))
}

fn parse_nested_property(i: &[u8]) -> IResult<&[u8], PacketType<'_>> {
    let (i, entity_id) = parse_unsigned_entity_id(i)?;
    let (i, is_slice) = le_i8(i)?;
    let (i, payload_size) = le_u8(i)?;
    let (payload, _unknown) = take(3usize)(i)?;
    if payload.len() != payload_size as usize {
        trace!(
            "nested property payload is {} bytes, header says {}",
            payload.len(),
            payload_size
        );
    }
    Ok((
        &payload[payload.len()..],
        PacketType::NestedProperty(NestedPropertyPacket {
            entity_id,
            is_slice: is_slice == 1,
            payload_size,
            payload,
        }),
    ))
}

/// Decodes the fixed layout of a packet payload. Schema driven parts
/// (property values, method arguments) are left as raw slices.
pub fn decode(packet_type: u32, payload: &[u8], table: PacketTable) -> Result<PacketType<'_>, ErrorKind> {
    let Some(kind) = table.kind(packet_type) else {
        return Ok(PacketType::Unknown(payload));
    };

    let parsed = match kind {
        PacketTypeKind::BasePlayerCreate => parse_base_player_create(payload),
        PacketTypeKind::CellPlayerCreate => parse_cell_player_create(payload),
        PacketTypeKind::EntityControl => parse_entity_control(payload),
        PacketTypeKind::EntityEnter => parse_entity_enter(payload),
        PacketTypeKind::EntityLeave => parse_entity_leave(payload),
        PacketTypeKind::EntityCreate => parse_entity_create(payload),
        PacketTypeKind::EntityProperty => parse_entity_property(payload),
        PacketTypeKind::EntityMethod => parse_entity_method(payload),
        PacketTypeKind::Position => parse_position(payload),
        PacketTypeKind::PlayerPosition => parse_player_position(payload),
        PacketTypeKind::Version => parse_version(payload),
        PacketTypeKind::Map => parse_map(payload),
        PacketTypeKind::NestedProperty => parse_nested_property(payload),
        PacketTypeKind::Unknown => Ok((&payload[payload.len()..], PacketType::Unknown(payload))),
    };

    let (_rest, packet) = parsed?;
    Ok(packet)
}

/// Iterates over the frames of a decrypted packet stream.
pub struct Parser<'a> {
    data: &'a [u8],
    offset: usize,
    table: PacketTable,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8], table: PacketTable) -> Self {
        Parser {
            data,
            offset: 0,
            table,
        }
    }

    pub fn table(&self) -> PacketTable {
        self.table
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Reads the next frame header and slices out its payload without
    /// interpreting it.
    pub fn next_frame(&mut self) -> Result<Option<(u32, GameClock, &'a [u8])>, ErrorKind> {
        if self.is_empty() {
            return Ok(None);
        }

        let start = self.offset;
        let i = &self.data[start..];
        let truncated = |_: nom::Err<Error>| ErrorKind::TruncatedFrame { offset: start };

        let (i, (packet_size, packet_type, clock)) =
            tuple((le_u32, le_u32, le_f32))(i).map_err(truncated)?;
        let (i, raw) = take(packet_size as usize)(i).map_err(truncated)?;

        self.offset = self.data.len() - i.len();
        Ok(Some((packet_type, GameClock(clock), raw)))
    }

    /// Reads and decodes the next packet. A frame that runs past the end of
    /// the stream is fatal. A payload that doesn't match its layout is
    /// returned as an error for that packet only, with the parser already
    /// positioned after it.
    pub fn next_packet(&mut self) -> Option<Result<Packet<'a>, ErrorKind>> {
        let (packet_type, clock, raw) = match self.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(err) => {
                // Nothing after a broken frame can be trusted
                self.offset = self.data.len();
                return Some(Err(err));
            }
        };

        trace!("packet {:#x} at {} ({} bytes)", packet_type, clock, raw.len());

        let payload = match decode(packet_type, raw, self.table) {
            Ok(payload) => payload,
            Err(err) => {
                return Some(Err(ErrorKind::Packet {
                    clock: clock.seconds(),
                    packet_type,
                    source: Box::new(err),
                }));
            }
        };

        if let PacketType::Unknown(data) = &payload {
            info!("unknown packet {:#x} ({} bytes)", packet_type, data.len());
        }

        Some(Ok(Packet {
            packet_size: raw.len() as u32,
            packet_type,
            clock,
            payload,
            raw,
        }))
    }
}

impl<'a> Iterator for Parser<'a> {
    type Item = Result<Packet<'a>, ErrorKind>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_packet()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Appends one frame to a packet stream.
    pub(crate) fn frame(stream: &mut Vec<u8>, packet_type: u32, clock: f32, payload: &[u8]) {
        stream.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        stream.extend_from_slice(&packet_type.to_le_bytes());
        stream.extend_from_slice(&clock.to_le_bytes());
        stream.extend_from_slice(payload);
    }

    #[test]
    fn tag_tables() {
        let legacy = PacketTable::for_version(&Version::new(12, 5, 0, 0));
        let current = PacketTable::for_version(&Version::new(12, 6, 0, 0));
        assert_eq!(legacy, PacketTable::Legacy);
        assert_eq!(current, PacketTable::Since12_6);

        assert_eq!(legacy.kind(0x22), Some(PacketTypeKind::NestedProperty));
        assert_eq!(legacy.kind(0x23), None);
        assert_eq!(current.kind(0x23), Some(PacketTypeKind::NestedProperty));
        assert_eq!(current.kind(0x28), Some(PacketTypeKind::Map));
        assert_eq!(current.kind(0x2c), Some(PacketTypeKind::PlayerPosition));
        assert_eq!(current.kind(0x2b), None);
        assert_eq!(current.kind(0x06), None);
        assert_eq!(legacy.kind(0x0a), current.kind(0x0a));
    }

    #[test]
    fn frames_and_unknown_tags() {
        let mut stream = Vec::new();
        frame(&mut stream, 0x04, 1.5, &7i32.to_le_bytes());
        frame(&mut stream, 0x99, 2.0, &[1, 2, 3]);

        let packets: Vec<_> = Parser::new(&stream, PacketTable::Since12_6)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(packets.len(), 2);
        assert!(matches!(
            packets[0].payload,
            PacketType::EntityLeave(EntityLeavePacket { entity_id }) if entity_id == EntityId(7)
        ));
        assert_eq!(packets[0].clock, GameClock(1.5));
        assert_eq!(packets[1].payload.kind(), PacketTypeKind::Unknown);
    }

    #[test]
    fn truncated_frame_is_fatal() {
        let mut stream = Vec::new();
        frame(&mut stream, 0x04, 1.0, &7i32.to_le_bytes());
        stream.extend_from_slice(&100u32.to_le_bytes());
        stream.extend_from_slice(&0x04u32.to_le_bytes());
        stream.extend_from_slice(&2.0f32.to_le_bytes());
        stream.extend_from_slice(&[0, 0]);

        let mut parser = Parser::new(&stream, PacketTable::Since12_6);
        assert!(parser.next_packet().unwrap().is_ok());
        let err = parser.next_packet().unwrap().unwrap_err();
        assert!(matches!(err, ErrorKind::TruncatedFrame { offset: 16 }));
        assert_eq!(err.category(), crate::ErrorCategory::Format);
        assert!(parser.next_packet().is_none());
    }

    #[test]
    fn short_payload_only_fails_that_packet() {
        let mut stream = Vec::new();
        frame(&mut stream, 0x03, 1.0, &[1, 0]);
        frame(&mut stream, 0x04, 2.0, &9i32.to_le_bytes());

        let mut parser = Parser::new(&stream, PacketTable::Since12_6);
        let err = parser.next_packet().unwrap().unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Decode);
        assert!(matches!(err, ErrorKind::Packet { packet_type: 3, .. }));
        assert!(parser.next_packet().unwrap().is_ok());
    }

    #[test]
    fn entity_create_reads_entity_and_vehicle() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&200i32.to_le_bytes());
        payload.extend_from_slice(&2i16.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&1i32.to_le_bytes());
        for v in [1.0f32, 2.0, 3.0, 0.0, 0.5, 0.0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.push(0);
        let PacketType::EntityCreate(create) = decode(0x05, &payload, PacketTable::Since12_6).unwrap() else {
            panic!("expected entity create");
        };
        assert_eq!(create.entity_id, EntityId(200));
        assert_eq!(create.entity_type, 2);
        assert_eq!(create.vehicle_id, EntityId(0));
        assert_eq!(create.space_id, 1);
        assert_eq!(create.state, &[0]);

        let mut position = Vec::new();
        position.extend_from_slice(&5i32.to_le_bytes());
        position.extend_from_slice(&6i32.to_le_bytes());
        for v in [0.0f32; 9] {
            position.extend_from_slice(&v.to_le_bytes());
        }
        position.push(0);
        let PacketType::Position(position) = decode(0x0a, &position, PacketTable::Since12_6).unwrap() else {
            panic!("expected position");
        };
        assert_eq!(position.entity_id, EntityId(5));
        assert_eq!(position.vehicle_id, EntityId(6));
        assert!(!position.is_error);
    }

    #[test]
    fn map_with_and_without_extra_block() {
        let name = b"spaces/16_OC_bees_to_honey";

        let mut short = Vec::new();
        short.extend_from_slice(&1i32.to_le_bytes());
        short.extend_from_slice(&42i64.to_le_bytes());
        short.extend_from_slice(&(name.len() as i32).to_le_bytes());
        short.extend_from_slice(name);
        short.extend_from_slice(&[0u8; 65]);
        let PacketType::Map(map) = decode(0x28, &short, PacketTable::Since12_6).unwrap() else {
            panic!("expected map");
        };
        assert_eq!(map.arena_id, 42);
        assert_eq!(map.name, "spaces/16_OC_bees_to_honey");

        let mut long = Vec::new();
        long.extend_from_slice(&1i32.to_le_bytes());
        long.extend_from_slice(&42i64.to_le_bytes());
        long.extend_from_slice(&0i32.to_le_bytes());
        long.extend_from_slice(&[0u8; 132]);
        long.extend_from_slice(&(name.len() as i32).to_le_bytes());
        long.extend_from_slice(name);
        let PacketType::Map(map) = decode(0x27, &long, PacketTable::Legacy).unwrap() else {
            panic!("expected map");
        };
        assert_eq!(map.name, "spaces/16_OC_bees_to_honey");
    }

    #[test]
    fn nested_property_header() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&5u32.to_le_bytes());
        payload.push(1);
        payload.push(2);
        payload.extend_from_slice(&[0, 0, 0]);
        payload.extend_from_slice(&[0xAA, 0xBB]);
        let PacketType::NestedProperty(nested) = decode(0x23, &payload, PacketTable::Since12_6).unwrap()
        else {
            panic!("expected nested property");
        };
        assert_eq!(nested.entity_id, EntityId(5));
        assert!(nested.is_slice);
        assert_eq!(nested.payload, &[0xAA, 0xBB]);
    }
}
