use std::borrow::Cow;
use std::io::Write;

use crypto::blowfish::Blowfish;
use crypto::symmetriccipher::BlockEncryptor;

use wows_timeline::analyzer::battle_controller::BattleStage;
use wows_timeline::analyzer::battle_controller::state::Frag;
use wows_timeline::rpc::entitydefs::{DataFileLoader, DataFileWithCallback};
use wows_timeline::types::{EntityId, Version};
use wows_timeline::versions::VersionRegistry;
use wows_timeline::{
    DecodeOptions, DecodeOptionsBuilder, DecodeSession, ErrorCategory, ErrorKind, REPLAY_SIGNATURE,
    decode_replay,
};

const SCHEMA: &[(&str, &str)] = &[
    (
        "14_2_0/scripts/entity_defs/alias.xml",
        "<root><ENTITY_ID>INT32</ENTITY_ID></root>",
    ),
    (
        "14_2_0/scripts/entities.xml",
        "<root><ClientServerEntities><Avatar/><BattleLogic/><Vehicle/></ClientServerEntities></root>",
    ),
    (
        "14_2_0/scripts/entity_defs/Avatar.def",
        r#"<root>
            <ClientMethods>
                <receiveVehicleDeath>
                    <Args>
                        <killedVehicleId>ENTITY_ID</killedVehicleId>
                        <fraggerVehicleId>ENTITY_ID</fraggerVehicleId>
                        <typeDeath>UINT32</typeDeath>
                    </Args>
                </receiveVehicleDeath>
            </ClientMethods>
        </root>"#,
    ),
    (
        "14_2_0/scripts/entity_defs/BattleLogic.def",
        r#"<root>
            <Properties>
                <battleStage><Type>UINT8</Type><Flags>ALL_CLIENTS</Flags></battleStage>
                <duration><Type>UINT16</Type><Flags>ALL_CLIENTS</Flags></duration>
                <timeLeft><Type>UINT16</Type><Flags>ALL_CLIENTS</Flags></timeLeft>
            </Properties>
        </root>"#,
    ),
    (
        "14_2_0/scripts/entity_defs/Vehicle.def",
        r#"<root>
            <Properties>
                <health><Type>FLOAT32</Type><Flags>ALL_CLIENTS</Flags></health>
            </Properties>
        </root>"#,
    ),
];

// Client property indices of BattleLogic, ordered by encoded size
const BATTLE_STAGE: u32 = 0;
const TIME_LEFT: u32 = 2;

const AVATAR: i32 = 100;
const BATTLE_LOGIC: i32 = 200;
const VEHICLE: i32 = 300;

fn loader() -> impl DataFileLoader {
    DataFileWithCallback::new(|path: &str| {
        SCHEMA
            .iter()
            .find(|(name, _)| *name == path)
            .map(|&(_, data)| Cow::Borrowed(data.as_bytes()))
            .ok_or_else(|| ErrorKind::MissingDefinitionFile(path.to_owned()))
    })
}

#[derive(Default)]
struct Stream(Vec<u8>);

impl Stream {
    fn frame(&mut self, packet_type: u32, clock: f32, payload: &[u8]) -> &mut Self {
        self.0.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.0.extend_from_slice(&packet_type.to_le_bytes());
        self.0.extend_from_slice(&clock.to_le_bytes());
        self.0.extend_from_slice(payload);
        self
    }

    fn version(&mut self, clock: f32, version: &str) -> &mut Self {
        let mut payload = (version.len() as i32).to_le_bytes().to_vec();
        payload.extend_from_slice(version.as_bytes());
        self.frame(0x16, clock, &payload)
    }

    fn base_player(&mut self, clock: f32, id: i32) -> &mut Self {
        let mut payload = id.to_le_bytes().to_vec();
        payload.extend_from_slice(&1i16.to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes());
        self.frame(0x00, clock, &payload)
    }

    fn entity_create(&mut self, clock: f32, id: i32, entity_type: i16, state: &[u8]) -> &mut Self {
        let mut payload = id.to_le_bytes().to_vec();
        payload.extend_from_slice(&entity_type.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&0i32.to_le_bytes());
        payload.extend_from_slice(&[0u8; 24]);
        payload.extend_from_slice(&(state.len() as u32).to_le_bytes());
        payload.extend_from_slice(state);
        self.frame(0x05, clock, &payload)
    }

    fn create_battle_logic(&mut self, clock: f32, duration: u16) -> &mut Self {
        let mut state = vec![3u8];
        state.extend_from_slice(&[0, 1]);
        state.push(1);
        state.extend_from_slice(&duration.to_le_bytes());
        state.push(2);
        state.extend_from_slice(&duration.to_le_bytes());
        self.entity_create(clock, BATTLE_LOGIC, 2, &state)
    }

    fn position(&mut self, clock: f32, id: i32, x: f32) -> &mut Self {
        let mut payload = id.to_le_bytes().to_vec();
        payload.extend_from_slice(&0i32.to_le_bytes());
        for v in [x, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        payload.push(0);
        self.frame(0x0a, clock, &payload)
    }

    fn property(&mut self, clock: f32, id: i32, index: u32, value: &[u8]) -> &mut Self {
        let mut payload = (id as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
        payload.extend_from_slice(value);
        self.frame(0x07, clock, &payload)
    }

    fn method(&mut self, clock: f32, id: i32, index: u32, args: &[u8]) -> &mut Self {
        let mut payload = (id as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(&index.to_le_bytes());
        payload.extend_from_slice(&(args.len() as u32).to_le_bytes());
        payload.extend_from_slice(args);
        self.frame(0x08, clock, &payload)
    }

    fn time_left(&mut self, clock: f32, time_left: u16) -> &mut Self {
        self.property(clock, BATTLE_LOGIC, TIME_LEFT, &time_left.to_le_bytes())
    }

    fn vehicle_death(&mut self, clock: f32, killed: i32, fragger: i32, death_type: u32) -> &mut Self {
        let mut args = killed.to_le_bytes().to_vec();
        args.extend_from_slice(&fragger.to_le_bytes());
        args.extend_from_slice(&death_type.to_le_bytes());
        self.method(clock, AVATAR, 0, &args)
    }
}

/// Battle starts, one second passes with a frag in between.
fn one_frag_battle() -> Stream {
    let mut stream = Stream::default();
    stream
        .version(0.0, "14,2,0,1234,0")
        .base_player(0.1, AVATAR)
        .create_battle_logic(0.2, 1200)
        .property(1.0, BATTLE_LOGIC, BATTLE_STAGE, &[0])
        .time_left(1.0, 1200)
        .vehicle_death(1.5, 5, 6, 2)
        .time_left(2.0, 1199)
        .frame(0x7f, 2.5, &[0xde, 0xad]);
    stream
}

fn session(strict: bool) -> DecodeSession {
    DecodeSession::new(
        Version::new(14, 2, 0, 1234),
        &loader(),
        &VersionRegistry::standard(),
        strict,
    )
    .unwrap()
}

#[test]
fn frag_lands_in_second_one() {
    let mut session = session(false);
    let error = session.play(&one_frag_battle().0).unwrap();
    assert_eq!(error, None);
    assert_eq!(session.player().listener().stage(), BattleStage::Active);
    assert!(session.player().entity_of_type("BattleLogic").is_some());

    let timeline = session.finish();
    assert_eq!(timeline.version, "14_2_0_1234");
    assert_eq!(timeline.owner_id, -1);
    assert_eq!(timeline.events.keys().copied().collect::<Vec<_>>(), [0, 1]);

    assert!(timeline.events[&0].frag.is_empty());
    assert_eq!(timeline.events[&0].time_left, 1200);
    assert_eq!(
        timeline.events[&1].frag,
        [Frag {
            killed_id: 5,
            fragger_id: 6,
            death_type: 2,
        }]
    );
    assert!(!timeline.events[&1].last_frame);
    assert_eq!(timeline.death_info[&5].killer_id, 6);
}

#[test]
fn decoding_is_deterministic() {
    let stream = one_frag_battle();
    let render = || {
        let mut session = session(false);
        session.play(&stream.0).unwrap();
        serde_json::to_string(&session.finish()).unwrap()
    };
    assert_eq!(render(), render());
}

#[test]
fn events_after_the_last_second_are_flushed() {
    let mut stream = one_frag_battle();
    stream.vehicle_death(2.7, 7, 8, 1);

    let mut session = session(false);
    session.play(&stream.0).unwrap();
    let timeline = session.finish();

    assert_eq!(timeline.events.keys().copied().collect::<Vec<_>>(), [0, 1, 2]);
    assert!(timeline.events[&2].last_frame);
    assert_eq!(timeline.events[&2].frag.len(), 1);
    assert_eq!(timeline.events[&2].frag[0].killed_id, 7);
}

#[test]
fn broken_packet_is_skipped_unless_strict() {
    let mut stream = one_frag_battle();
    // Arguments cut short
    stream.method(2.6, AVATAR, 0, &[1, 0, 0, 0]).time_left(3.0, 1198);

    let mut lenient = session(false);
    let error = lenient.play(&stream.0).unwrap();
    assert!(error.is_some());
    let timeline = lenient.finish();
    assert_eq!(timeline.events.keys().copied().collect::<Vec<_>>(), [0, 1, 2]);
    assert!(timeline.events[&2].frag.is_empty());

    let mut strict = session(true);
    let err = strict.play(&stream.0).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Decode);
    assert!(matches!(err, ErrorKind::Packet { packet_type: 0x08, .. }));
}

#[test]
fn unknown_entity_is_tolerated() {
    let mut stream = one_frag_battle();
    stream.property(2.6, 999, 0, &[1]);

    for strict in [false, true] {
        let mut session = session(strict);
        assert_eq!(session.play(&stream.0).unwrap(), None);
        assert!(!session.player().entities().contains_key(&EntityId(999)));
    }
}

#[test]
fn unsupported_version_fails_before_packets() {
    let err = DecodeSession::new(
        Version::new(0, 11, 0, 0),
        &loader(),
        &VersionRegistry::standard(),
        false,
    )
    .err()
    .unwrap();
    assert!(matches!(err, ErrorKind::UnsupportedVersion(_)));
}

/// Packs a packet stream the way the game client writes replays.
fn container(version: &str, packet_data: &[u8]) -> Vec<u8> {
    const KEY: [u8; 16] = [
        0x29, 0xB7, 0xC9, 0x09, 0x38, 0x3F, 0x84, 0x88, 0xFA, 0x98, 0xEC, 0x4E, 0x13, 0x19, 0x79,
        0xFB,
    ];

    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(packet_data).unwrap();
    let mut plain = encoder.finish().unwrap();
    plain.resize(plain.len().div_ceil(8) * 8, 0);

    let blowfish = Blowfish::new(&KEY);
    let mut encrypted = vec![0u8; 8];
    let mut previous = [0u8; 8];
    for chunk in plain.chunks_exact(8) {
        let mut mixed = [0u8; 8];
        for (idx, byte) in mixed.iter_mut().enumerate() {
            *byte = chunk[idx] ^ previous[idx];
        }
        let mut out = [0u8; 8];
        blowfish.encrypt_block(&mixed, &mut out);
        encrypted.extend_from_slice(&out);
        previous.copy_from_slice(chunk);
    }

    let header = serde_json::to_vec(&serde_json::json!({
        "clientVersionFromXml": version,
        "mapName": "spaces/16_OC_bees_to_honey",
        "playerName": "captain",
    }))
    .unwrap();

    let mut contents = REPLAY_SIGNATURE.to_vec();
    contents.extend_from_slice(&1i32.to_le_bytes());
    contents.extend_from_slice(&(header.len() as u32).to_le_bytes());
    contents.extend_from_slice(&header);
    contents.extend_from_slice(&encrypted);
    contents
}

#[test]
fn whole_replay_file() {
    let raw_path = std::env::temp_dir().join(format!("wows-timeline-{}.bin", std::process::id()));
    let options = DecodeOptionsBuilder::default()
        .raw_output(raw_path.clone())
        .build()
        .unwrap();
    let stream = one_frag_battle();

    let info = decode_replay(
        &container("14,2,0,1234", &stream.0),
        &loader(),
        &VersionRegistry::standard(),
        &options,
    )
    .unwrap();

    assert_eq!(info.meta.playerName, "captain");
    assert_eq!(info.error, None);
    assert_eq!(info.timeline.events.len(), 2);
    assert_eq!(std::fs::read(&raw_path).unwrap(), stream.0);
    std::fs::remove_file(&raw_path).unwrap();
}

#[test]
fn whole_replay_of_unknown_version() {
    let err = decode_replay(
        &container("0,11,0", &one_frag_battle().0),
        &loader(),
        &VersionRegistry::standard(),
        &DecodeOptions::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ErrorKind::UnsupportedVersion(_)));
}

#[test]
fn malformed_create_leaves_no_trace() {
    let mut stream = Stream::default();
    stream
        .version(0.0, "14,2,0,1234,0")
        .base_player(0.1, AVATAR)
        // battleStage = 0 followed by a stray byte
        .entity_create(0.2, BATTLE_LOGIC, 2, &[1, 0, 0, 0xff]);

    let mut lenient = session(false);
    let error = lenient.play(&stream.0).unwrap();
    assert!(error.unwrap().contains("unconsumed"));
    assert!(lenient.player().entity_of_type("BattleLogic").is_none());
    assert_eq!(lenient.player().listener().stage(), BattleStage::Loading);

    let mut strict = session(true);
    let err = strict.play(&stream.0).unwrap_err();
    assert!(matches!(err, ErrorKind::Packet { packet_type: 0x05, .. }));
    assert_eq!(strict.player().listener().stage(), BattleStage::Loading);
}

#[test]
fn vehicle_without_roster_record_is_still_created() {
    let mut state = vec![1u8, 0];
    state.extend_from_slice(&15000f32.to_le_bytes());

    let mut stream = one_frag_battle();
    stream
        .entity_create(2.6, VEHICLE, 3, &state)
        .position(2.7, VEHICLE, 42.0)
        .property(2.8, VEHICLE, 0, &14000f32.to_le_bytes());

    for strict in [false, true] {
        let mut session = session(strict);
        assert_eq!(session.play(&stream.0).unwrap(), None);
        let vehicle = &session.player().entities()[&EntityId(VEHICLE as u32)];
        assert_eq!(vehicle.type_name(), "Vehicle");
        assert_eq!(vehicle.position.x, 42.0);
        assert_eq!(
            vehicle.client_property("health").and_then(|v| v.as_f64()),
            Some(14000.0)
        );
    }
}
