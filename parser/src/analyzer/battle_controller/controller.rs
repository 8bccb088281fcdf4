use std::collections::{BTreeMap, HashMap};

use nom::{multi::count, number::complete::le_u32, sequence::pair};
use serde_json::Value as Json;
use tracing::{debug, trace, warn};

use crate::IResult;
use crate::entity::{Binding, Entity, MethodArgs, MethodHandler, NestedHandler, PropertyHandler};
use crate::error::ErrorKind;
use crate::game_constants::{
    DamageStatsType, DeathType, PlayerType, RosterFields, TaskCategory, TaskStatus, TaskType,
};
use crate::packet2::MapPacket;
use crate::rpc::typedefs::ArgValue;
use crate::types::{EntityId, GameClock, Relation, Version};
use crate::unpack::{HIDDEN_POSITION, MinimapPosition, PlaneId};

use super::listener::ReplayListener;
use super::players::{PlayersInfo, RosterEntry, hashable_i64, unpickle};
use super::state::{
    AcousticTorpedo, Building, BuildingInfo, Consumable, ControlPoint, Frag, MapPos, Message,
    Plane, PlayerInfo, Replace, Score, ShipConfig, Shot, Skills, Smoke, Torpedo, Units, Vehicle,
    Ward,
};
use super::timeline::{BattleResult, DamageMaps, DeathInfo, Events, TaskInfo, Timeline};

/// Ward radius used when the server sends none.
const DEFAULT_WARD_RADIUS: f64 = 60.0;

/// Artillery `serverTimeLeft` units per tick.
const SHELL_TIME_SCALE: f64 = 2.75;

/// Where the battle is, as far as snapshots are concerned. Snapshots are only
/// committed while `Active`; `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BattleStage {
    #[default]
    Loading,
    Active,
    Ended,
}

/// Turns entity property changes and method calls into the per-second
/// [`Timeline`].
///
/// Persistent tables (vehicles, buildings, planes, ...) hold the latest state;
/// accumulators (shots, frags, chat, ...) collect what happened since the last
/// committed second and are cleared on every commit.
pub struct BattleController {
    version: Version,
    roster_fields: &'static RosterFields,
    clock: GameClock,
    stage: BattleStage,

    owner: Option<RosterEntry>,
    player_id: Option<EntityId>,
    players: PlayersInfo,
    arena_id: i64,
    map: String,
    game_version: String,

    durations: Vec<i64>,
    time_left: i64,
    battle_stage: i64,
    battle_type: i64,
    win_score: i64,
    result: BattleResult,

    info: BTreeMap<i64, PlayerInfo>,
    building_info: BTreeMap<i64, BuildingInfo>,
    vehicles: BTreeMap<i64, Vehicle>,
    buildings: BTreeMap<i64, Building>,
    smokes: BTreeMap<i64, Smoke>,
    planes: BTreeMap<i64, Plane>,
    wards: BTreeMap<i64, Ward>,
    scores: BTreeMap<Relation, Score>,
    controls: BTreeMap<i64, ControlPoint>,
    vehicle_to_id: HashMap<i64, i64>,
    events: BTreeMap<i64, Events>,

    achievements: BTreeMap<i64, BTreeMap<i64, i64>>,
    ribbons: BTreeMap<EntityId, BTreeMap<i64, i64>>,
    damage_maps: DamageMaps,
    shots_damage_map: BTreeMap<EntityId, BTreeMap<i64, f64>>,
    death_map: Vec<Frag>,
    dead_planes: HashMap<i64, i64>,

    acc_shots: Vec<Shot>,
    acc_torpedoes: BTreeMap<i64, Torpedo>,
    acc_hits: Vec<i64>,
    acc_consumables: BTreeMap<EntityId, Vec<Consumable>>,
    acc_frags: Vec<Frag>,
    acc_messages: Vec<Message>,
    acc_acoustic_torpedoes: BTreeMap<i64, AcousticTorpedo>,
}

impl BattleController {
    /// `version` is the client version from the replay header; it selects the
    /// ship config layout.
    pub fn new(version: Version, roster_fields: &'static RosterFields) -> Self {
        BattleController {
            version,
            roster_fields,
            clock: GameClock(0.0),
            stage: BattleStage::Loading,
            owner: None,
            player_id: None,
            players: PlayersInfo::default(),
            arena_id: 0,
            map: String::new(),
            game_version: String::new(),
            durations: Vec::new(),
            time_left: 0,
            battle_stage: -1,
            battle_type: 0,
            win_score: 1000,
            result: BattleResult::default(),
            info: BTreeMap::new(),
            building_info: BTreeMap::new(),
            vehicles: BTreeMap::new(),
            buildings: BTreeMap::new(),
            smokes: BTreeMap::new(),
            planes: BTreeMap::new(),
            wards: BTreeMap::new(),
            scores: BTreeMap::new(),
            controls: BTreeMap::new(),
            vehicle_to_id: HashMap::new(),
            events: BTreeMap::new(),
            achievements: BTreeMap::new(),
            ribbons: BTreeMap::new(),
            damage_maps: DamageStatsType::ALL
                .iter()
                .map(|kind| (*kind, BTreeMap::new()))
                .collect(),
            shots_damage_map: BTreeMap::new(),
            death_map: Vec::new(),
            dead_planes: HashMap::new(),
            acc_shots: Vec::new(),
            acc_torpedoes: BTreeMap::new(),
            acc_hits: Vec::new(),
            acc_consumables: BTreeMap::new(),
            acc_frags: Vec::new(),
            acc_messages: Vec::new(),
            acc_acoustic_torpedoes: BTreeMap::new(),
        }
    }

    /// Every property, method and nested-property handler the controller
    /// needs, ready for a [`crate::entity::DispatchTable`].
    pub fn bindings() -> Vec<Binding<BattleController>> {
        vec![
            property("BattleLogic", "timeLeft", on_time_left),
            property("BattleLogic", "duration", on_duration),
            property("BattleLogic", "battleStage", on_battle_stage),
            property("BattleLogic", "battleResult", on_battle_result),
            property("BattleLogic", "state", on_battle_state),
            property("BattleLogic", "battleType", on_battle_type),
            nested("BattleLogic", "state.missions.teamsScore", on_team_score),
            property("Vehicle", "health", on_health),
            property("Vehicle", "isAlive", on_vehicle_alive),
            property("Vehicle", "isInvisible", on_invisible),
            property("Vehicle", "shipConfig", on_ship_config),
            property("Vehicle", "crewModifiersCompactParams", on_crew_params),
            property("Vehicle", "visibilityFlags", on_visibility_flags),
            property("Vehicle", "regeneratedHealth", on_regenerated_health),
            property("Vehicle", "regenCrewHpLimit", on_regen_crew_hp_limit),
            property("Vehicle", "regenerationHealth", on_regeneration_health),
            property("Vehicle", "burningFlags", on_burning_flags),
            property("Vehicle", "maxHealth", on_max_health),
            method("Vehicle", "setConsumables", on_set_consumables),
            method("Vehicle", "consumableUsed", on_consumable_used),
            method("Vehicle", "receiveDamagesOnShip", on_damages_on_ship),
            property("Building", "isSuppressed", on_building_suppressed),
            property("Building", "isAlive", on_building_alive),
            property("InteractiveZone", "componentsState", on_components_state),
            nested("InteractiveZone", "componentsState.captureLogic", on_capture_logic),
            nested("SmokeScreen", "points", on_smoke_points),
            method("Avatar", "onArenaStateReceived", on_arena_state_received),
            method("Avatar", "onGameRoomStateChanged", on_game_room_state_changed),
            method("Avatar", "onNewPlayerSpawnedInBattle", on_new_player_spawned),
            method("Avatar", "receiveVehicleDeath", on_vehicle_death),
            method("Avatar", "onAchievementEarned", on_achievement_earned),
            method("Avatar", "receiveDamageStat", on_damage_stat),
            method("Avatar", "receive_planeDeath", on_plane_death),
            method("Avatar", "updateMinimapVisionInfo", on_minimap_vision),
            method("Avatar", "receiveArtilleryShots", on_artillery_shots),
            method("Avatar", "receiveTorpedoes", on_torpedoes),
            method("Avatar", "receiveShotKills", on_shot_kills),
            method("Avatar", "receive_addMinimapSquadron", on_add_squadron),
            method("Avatar", "receive_updateMinimapSquadron", on_update_squadron),
            method("Avatar", "receive_removeMinimapSquadron", on_remove_squadron),
            method("Avatar", "receive_wardAdded", on_ward_added),
            method("Avatar", "receive_wardRemoved", on_ward_removed),
            method("Avatar", "onChatMessage", on_chat_message),
            method("Avatar", "receiveTorpedoDirection", on_torpedo_direction),
            nested("Avatar", "privateVehicleState.ribbons", on_ribbons),
        ]
    }

    pub fn stage(&self) -> BattleStage {
        self.stage
    }

    pub fn clock(&self) -> GameClock {
        self.clock
    }

    pub fn events(&self) -> &BTreeMap<i64, Events> {
        &self.events
    }

    pub fn players(&self) -> &PlayersInfo {
        &self.players
    }

    /// Commits the trailing sub-second events and assembles the timeline.
    /// `battle_logic` is the live BattleLogic entity, if one was created.
    pub fn finish(&mut self, battle_logic: Option<&Entity>) -> Timeline {
        self.flush_last_frame(battle_logic);

        let (owner_avatar_id, owner_vehicle_id, owner_id) = match &self.owner {
            Some(owner) => (
                entry_i64(owner, "avatarId"),
                entry_i64(owner, "shipId"),
                entry_i64(owner, "id"),
            ),
            None => {
                warn!("replay owner never appeared in the roster");
                (-1, -1, -1)
            }
        };

        let mut players = self.players.to_map();
        for player in players.values_mut() {
            let ship_id = player.get("shipId").and_then(Json::as_i64).unwrap_or(0);
            let planes = self.dead_planes.get(&ship_id).copied().unwrap_or(0);
            player.insert("planesCount".to_owned(), Json::from(planes));
        }

        let state = battle_logic.and_then(|entity| entity.client_property("state"));
        let control_points = state
            .and_then(|state| state.get("controlPoints"))
            .and_then(|points| serde_json::to_value(points).ok())
            .unwrap_or_else(|| Json::Array(Vec::new()));
        let tasks: Vec<TaskInfo> = state
            .and_then(|state| state.get("tasks"))
            .and_then(ArgValue::as_list)
            .map(|tasks| tasks.iter().map(task_info).collect())
            .unwrap_or_default();

        Timeline {
            arena_id: self.arena_id,
            version: self.timeline_version(),
            map: self.map.clone(),
            battle_type: self.battle_type,
            win_score: self.win_score,
            result: self.result,
            owner_avatar_id,
            owner_vehicle_id,
            owner_id,
            player_info: self.info.clone(),
            building_info: self.building_info.clone(),
            events: std::mem::take(&mut self.events),
            players,
            achievements: self.achievements.clone(),
            ribbons: self.ribbons.clone(),
            damage_maps: self.damage_maps.clone(),
            shots_damage_map: self.shots_damage_map.clone(),
            death_info: self.death_info(),
            control_points,
            tasks,
        }
    }

    /// `13,0,0,7851390,0` style version packet text becomes `13_0_0_7851390`.
    fn timeline_version(&self) -> String {
        if self.game_version.is_empty() {
            return self.version.to_schema_key();
        }
        let mut trimmed = self.game_version.clone();
        trimmed.pop();
        trimmed.pop();
        trimmed.replace(',', "_")
    }

    fn death_info(&self) -> BTreeMap<i64, DeathInfo> {
        let mut deaths = BTreeMap::new();
        for frag in &self.death_map {
            let Some(death_type) = DeathType::from_id(frag.death_type) else {
                warn!("unknown death type {}", frag.death_type);
                continue;
            };
            deaths.insert(
                frag.killed_id,
                DeathInfo {
                    killer_id: frag.fragger_id,
                    icon: death_type.icon(),
                    name: death_type.name(),
                },
            );
        }
        deaths
    }

    fn owner_team(&self) -> Result<i64, ErrorKind> {
        self.owner
            .as_ref()
            .and_then(|owner| owner.get("teamId"))
            .and_then(Json::as_i64)
            .ok_or(ErrorKind::OwnerUnknown)
    }

    fn player_for_vehicle(&self, vehicle_id: i64) -> Result<i64, ErrorKind> {
        self.vehicle_to_id
            .get(&vehicle_id)
            .copied()
            .ok_or(ErrorKind::MissingRecord {
                table: "vehicle_to_id",
                id: vehicle_id,
            })
    }

    fn accumulators_empty(&self) -> bool {
        self.acc_shots.is_empty()
            && self.acc_torpedoes.is_empty()
            && self.acc_hits.is_empty()
            && self.acc_consumables.is_empty()
            && self.acc_frags.is_empty()
            && self.acc_messages.is_empty()
            && self.acc_acoustic_torpedoes.is_empty()
    }

    fn clear_accumulators(&mut self) {
        self.acc_shots.clear();
        self.acc_torpedoes.clear();
        self.acc_hits.clear();
        self.acc_consumables.clear();
        self.acc_frags.clear();
        self.acc_messages.clear();
        self.acc_acoustic_torpedoes.clear();
    }

    fn snapshot(&self, battle_logic: Option<&Entity>, last_frame: bool) -> Events {
        Events {
            time_left: self.time_left,
            vehicle: self.vehicles.clone(),
            building: self.buildings.clone(),
            plane: self.planes.clone(),
            ward: self.wards.clone(),
            smoke: self.smokes.clone(),
            shot: self.acc_shots.clone(),
            torpedo: self.acc_torpedoes.clone(),
            hits: self.acc_hits.clone(),
            consumable: self.acc_consumables.clone(),
            control: self.controls.clone(),
            score: self.scores.clone(),
            damage_maps: self.damage_maps.clone(),
            frag: self.acc_frags.clone(),
            ribbon: self.ribbons.clone(),
            achievement: self.achievements.clone(),
            times_to_win: self.times_to_win(battle_logic),
            chat: self.acc_messages.clone(),
            acoustic_torpedo: self.acc_acoustic_torpedoes.clone(),
            last_frame,
        }
    }

    /// Commits the snapshot for the current `timeLeft`. Keys never go
    /// backwards; a repeated or earlier second keeps its accumulators for the
    /// next commit.
    fn commit_tick(&mut self, battle_logic: &Entity) {
        let Some(duration) = self.durations.last().copied() else {
            debug!("timeLeft before any duration, skipping tick");
            return;
        };
        let battle_time = duration - self.time_left;
        if let Some((&last, _)) = self.events.last_key_value() {
            if battle_time <= last {
                trace!("battle time {} not after {}, skipping tick", battle_time, last);
                return;
            }
        }

        let events = self.snapshot(Some(battle_logic), false);
        self.events.insert(battle_time, events);
        self.clear_accumulators();
    }

    /// Anything accumulated after the last full second lands one second
    /// after it.
    fn flush_last_frame(&mut self, battle_logic: Option<&Entity>) {
        if self.accumulators_empty() {
            return;
        }
        let Some((&last, _)) = self.events.last_key_value() else {
            debug!("no committed seconds, dropping trailing events");
            return;
        };
        let events = self.snapshot(battle_logic, true);
        self.events.insert(last + 1, events);
        self.clear_accumulators();
    }

    fn times_to_win(&self, battle_logic: Option<&Entity>) -> Option<(f64, f64)> {
        if self.time_left == 0 {
            return None;
        }

        let hold = battle_logic?
            .client_property("state")?
            .get("missions")?
            .get("hold")?
            .as_list()?
            .first()?;
        let reward = hold.get("reward")?.as_f64()?;
        let period = hold.get("period")?.as_f64()?;

        let (mut ally_tick, mut enemy_tick) = (0.0, 0.0);
        for cap in self.controls.values() {
            if !cap.both_inside && cap.team_id != -1 {
                if cap.relation == Relation::Ally {
                    ally_tick += reward;
                } else {
                    enemy_tick += reward;
                }
            }
        }

        let ally_left = self.win_score - self.scores.get(&Relation::Ally)?.score;
        let enemy_left = self.win_score - self.scores.get(&Relation::Enemy)?.score;
        Some((
            time_to_win(ally_tick, period, ally_left),
            time_to_win(enemy_tick, period, enemy_left),
        ))
    }

    /// Resolves the owner once it shows up in the roster and derives the
    /// static player and building tables. Existing records are kept.
    fn create_player_vehicle_data(&mut self) {
        if self.owner.is_none() {
            if let Some(avatar_id) = self.player_id {
                self.owner = self.players.find_by_avatar(avatar_id.raw() as i64).cloned();
            }
        }
        let Some(owner) = self.owner.as_ref() else {
            debug!("owner not in the roster yet");
            return;
        };
        let owner_team = entry_i64(owner, "teamId");
        let owner_avatar = entry_i64(owner, "avatarId");

        for (_, player) in self.players.iter() {
            let player_type = PlayerType::from_repr(entry_i64(player, "playerType") as u8);
            if player_type == Some(PlayerType::Observer) {
                continue;
            }

            let is_ally = owner_team == entry_i64(player, "teamId");
            let avatar = player
                .get("avatarId")
                .or_else(|| player.get("id"))
                .and_then(Json::as_i64);
            let is_owner = avatar == Some(owner_avatar);
            let relation = Relation::from_flags(is_ally, is_owner);

            match player_type {
                Some(PlayerType::Player | PlayerType::Bot) => {
                    let id = entry_i64(player, "id");
                    let ship_id = entry_i64(player, "shipId");
                    let max_health = entry_f64(player, "maxHealth");
                    self.info.entry(id).or_insert_with(|| PlayerInfo {
                        id,
                        account_db_id: entry_i64(player, "accountDBID"),
                        clan_color: entry_i64(player, "clanColor"),
                        clan_id: entry_i64(player, "clanID"),
                        clan_tag: entry_string(player, "clanTag"),
                        max_health,
                        name: entry_string(player, "name"),
                        realm: entry_string(player, "realm"),
                        ship_id,
                        team_id: entry_i64(player, "teamId"),
                        is_bot: entry_bool(player, "isBot"),
                        ship_params_id: entry_i64(player, "shipParamsId"),
                        relation,
                        hull: None,
                        abilities: Vec::new(),
                        modernization: Vec::new(),
                        skills: Skills::default(),
                        ship_components: player.get("shipComponents").cloned().unwrap_or_default(),
                        units: None,
                        signals: None,
                    });
                    self.vehicle_to_id.entry(ship_id).or_insert(id);
                    self.vehicles.entry(ship_id).or_insert_with(|| Vehicle {
                        player_id: id,
                        vehicle_id: ship_id,
                        health: max_health,
                        is_alive: true,
                        x: HIDDEN_POSITION.0 as i64,
                        y: HIDDEN_POSITION.1 as i64,
                        yaw: -180,
                        relation,
                        is_visible: false,
                        not_in_range: false,
                        visibility_flag: 0,
                        burn_flags: 0,
                        consumables_state: BTreeMap::new(),
                        regenerated_health: 0.0,
                        regen_crew_hp_limit: 0.0,
                        regeneration_health: 0.0,
                    });
                }
                Some(PlayerType::Building) => {
                    let id = entry_i64(player, "id");
                    let is_alive = entry_bool(player, "isAlive");
                    let is_suppressed = entry_bool(player, "isSuppressed");
                    self.building_info.entry(id).or_insert_with(|| BuildingInfo {
                        id,
                        is_alive,
                        is_hidden: entry_bool(player, "isHidden"),
                        is_suppressed,
                        name: entry_string(player, "name"),
                        params_id: entry_i64(player, "paramsId"),
                        team_id: entry_i64(player, "teamId"),
                        unique_id: entry_i64(player, "uniqueId"),
                        relation,
                        clan_tag: entry_string(player, "clanTag"),
                    });
                    self.buildings.entry(id).or_insert_with(|| Building {
                        is_alive,
                        is_suppressed,
                        is_visible: false,
                        x: HIDDEN_POSITION.0 as i64,
                        y: HIDDEN_POSITION.1 as i64,
                        yaw: -180,
                    });
                }
                _ => {}
            }
        }
    }

    fn update_roster(&mut self, blob: &ArgValue, player_type: PlayerType) -> Result<(), ErrorKind> {
        let blob = bytes(blob, "roster")?;
        self.players
            .create_or_update(blob, player_type, self.roster_fields)
    }

    fn set_score(&mut self, score: &ArgValue) -> Result<(), ErrorKind> {
        let team_id = int(field(score, "teamId")?, "teamId")?;
        let relation = if team_id == self.owner_team()? {
            Relation::Ally
        } else {
            Relation::Enemy
        };
        let value = int(field(score, "score")?, "score")?;
        let next = match self.scores.get(&relation) {
            Some(current) => current.replace(|s| s.score = value),
            None => Score {
                relation,
                score: value,
            },
        };
        self.scores.insert(relation, next);
        Ok(())
    }

    /// Rebuilds the control point record from the zone's current
    /// `componentsState`.
    fn refresh_control_point(&mut self, entity: &Entity, state: &ArgValue) -> Result<(), ErrorKind> {
        let control_point = field(state, "controlPoint")?;
        if !matches!(control_point, ArgValue::FixedDict(_)) {
            return Ok(());
        }
        let logic = field(state, "captureLogic")?;

        let team_id = entity
            .client_property("teamId")
            .and_then(ArgValue::as_i64)
            .unwrap_or(-1);
        let relation = Relation::from_teams(team_id, self.owner_team()?);
        let radius = entity
            .client_property("radius")
            .and_then(ArgValue::as_f64)
            .unwrap_or_default();

        let index = int(field(control_point, "index")?, "controlPoint.index")?;
        let cap = ControlPoint {
            position: (
                round(entity.position.x as f64),
                round(entity.position.z as f64),
            ),
            radius,
            team_id,
            invader_team: int(field(logic, "invaderTeam")?, "invaderTeam")?,
            control_point_type: int(field(control_point, "type")?, "controlPoint.type")?,
            progress: pair_of(field(logic, "progress")?, "progress")?,
            both_inside: flag(field(logic, "bothInside")?, "bothInside")?,
            has_invaders: flag(field(logic, "hasInvaders")?, "hasInvaders")?,
            capture_time: float(field(logic, "captureTime")?, "captureTime")?,
            capture_speed: float(field(logic, "captureSpeed")?, "captureSpeed")?,
            relation,
            is_visible: flag(field(logic, "isVisible")?, "isVisible")?,
        };
        self.controls.insert(index, cap);
        Ok(())
    }
}

impl ReplayListener for BattleController {
    fn set_clock(&mut self, clock: GameClock) {
        self.clock = clock;
    }

    fn on_version(&mut self, version: &str) {
        self.game_version = version.to_owned();
    }

    fn on_map(&mut self, map: &MapPacket) {
        self.map = map
            .name
            .strip_prefix("spaces/")
            .unwrap_or(&map.name)
            .to_owned();
    }

    fn on_player_enter_world(&mut self, entity_id: EntityId) {
        self.player_id = Some(entity_id);
    }

    fn on_entity_create(&mut self, entity: &Entity) -> Result<(), ErrorKind> {
        if entity.type_name() != "SmokeScreen" {
            return Ok(());
        }
        let radius = entity
            .client_property("radius")
            .and_then(ArgValue::as_f64)
            .unwrap_or_default();
        let points = entity
            .client_property("points")
            .map(smoke_points)
            .transpose()?
            .unwrap_or_default();
        let id = entity.id().raw() as i64;
        let smoke = match self.smokes.get(&id) {
            Some(current) => current.replace(|s| {
                s.radius = radius;
                s.points = points;
            }),
            None => Smoke {
                entity_id: entity.id(),
                radius,
                points,
            },
        };
        self.smokes.insert(id, smoke);
        Ok(())
    }

    fn on_entity_leave(&mut self, entity_id: EntityId) {
        self.smokes.remove(&(entity_id.raw() as i64));
    }
}

fn property(
    entity_type: &'static str,
    property: &'static str,
    handler: PropertyHandler<BattleController>,
) -> Binding<BattleController> {
    Binding::Property {
        entity_type,
        property,
        handler,
    }
}

fn method(
    entity_type: &'static str,
    method: &'static str,
    handler: MethodHandler<BattleController>,
) -> Binding<BattleController> {
    Binding::Method {
        entity_type,
        method,
        handler,
    }
}

fn nested(
    entity_type: &'static str,
    path: &'static str,
    handler: NestedHandler<BattleController>,
) -> Binding<BattleController> {
    Binding::NestedProperty {
        entity_type,
        path,
        handler,
    }
}

fn time_to_win(reward: f64, period: f64, score_left: i64) -> f64 {
    if reward == 0.0 {
        return -1.0;
    }
    period * score_left as f64 / reward
}

/// Shot and torpedo ids are the decimal digits of the owner id followed by
/// those of the per-owner id.
fn concat_ids(owner_id: i64, id: i64) -> Result<i64, ErrorKind> {
    if id < 0 {
        return Err(ErrorKind::unexpected(format!("negative shot id {}", id)));
    }
    let overflow = || ErrorKind::unexpected(format!("shot id {} of owner {} overflows", id, owner_id));
    let digits = id.checked_ilog10().unwrap_or(0) + 1;
    let shifted = 10i64
        .checked_pow(digits)
        .and_then(|scale| owner_id.checked_mul(scale))
        .ok_or_else(overflow)?;
    let joined = if owner_id < 0 {
        shifted.checked_sub(id)
    } else {
        shifted.checked_add(id)
    };
    joined.ok_or_else(overflow)
}

/// Half-to-even, like the minimap grid the timeline is consumed on.
fn round(value: f64) -> i64 {
    value.round_ties_even() as i64
}

fn entity_key(entity: &Entity) -> i64 {
    entity.id().raw() as i64
}

fn replace_in<V: Replace>(
    table: &mut BTreeMap<i64, V>,
    name: &'static str,
    id: i64,
    update: impl FnOnce(&mut V),
) -> Result<(), ErrorKind> {
    let next = table
        .get(&id)
        .ok_or(ErrorKind::MissingRecord { table: name, id })?
        .replace(update);
    table.insert(id, next);
    Ok(())
}

fn int(value: &ArgValue, what: &str) -> Result<i64, ErrorKind> {
    value
        .as_i64()
        .ok_or_else(|| ErrorKind::unexpected(format!("{} is not an integer: {:?}", what, value)))
}

fn float(value: &ArgValue, what: &str) -> Result<f64, ErrorKind> {
    value
        .as_f64()
        .ok_or_else(|| ErrorKind::unexpected(format!("{} is not a number: {:?}", what, value)))
}

fn flag(value: &ArgValue, what: &str) -> Result<bool, ErrorKind> {
    value
        .as_bool()
        .ok_or_else(|| ErrorKind::unexpected(format!("{} is not a flag: {:?}", what, value)))
}

fn bytes<'v>(value: &'v ArgValue, what: &str) -> Result<&'v [u8], ErrorKind> {
    value
        .as_bytes()
        .ok_or_else(|| ErrorKind::unexpected(format!("{} is not a blob: {:?}", what, value)))
}

fn list<'v>(value: &'v ArgValue, what: &str) -> Result<&'v [ArgValue], ErrorKind> {
    value
        .as_list()
        .ok_or_else(|| ErrorKind::unexpected(format!("{} is not an array: {:?}", what, value)))
}

fn field<'v>(value: &'v ArgValue, name: &str) -> Result<&'v ArgValue, ErrorKind> {
    value
        .get(name)
        .ok_or_else(|| ErrorKind::unexpected(format!("missing field {}", name)))
}

/// Horizontal plane coordinates: `(x, z)` of a 3D vector, `(x, y)` of a 2D one.
fn planar(value: &ArgValue, what: &str) -> Result<(f64, f64), ErrorKind> {
    match value {
        ArgValue::Vector3((x, _, z)) => Ok((*x as f64, *z as f64)),
        ArgValue::Vector2((x, y)) => Ok((*x as f64, *y as f64)),
        other => Err(ErrorKind::unexpected(format!(
            "{} is not a position: {:?}",
            what, other
        ))),
    }
}

fn grid(value: &ArgValue, what: &str) -> Result<MapPos, ErrorKind> {
    let (x, y) = planar(value, what)?;
    Ok((round(x), round(y)))
}

fn pair_of(value: &ArgValue, what: &str) -> Result<(f64, f64), ErrorKind> {
    match value {
        ArgValue::Vector2((a, b)) => Ok((*a as f64, *b as f64)),
        other => match list(other, what)? {
            [a, b, ..] => Ok((float(a, what)?, float(b, what)?)),
            _ => Err(ErrorKind::unexpected(format!("{} is too short", what))),
        },
    }
}

fn smoke_points(value: &ArgValue) -> Result<Vec<(f64, f64)>, ErrorKind> {
    list(value, "points")?
        .iter()
        .map(|point| planar(point, "smoke point"))
        .collect()
}

fn entry_i64(entry: &RosterEntry, key: &str) -> i64 {
    match entry.get(key) {
        Some(Json::Bool(b)) => *b as i64,
        Some(value) => value.as_i64().unwrap_or_default(),
        None => 0,
    }
}

fn entry_f64(entry: &RosterEntry, key: &str) -> f64 {
    entry.get(key).and_then(Json::as_f64).unwrap_or_default()
}

fn entry_bool(entry: &RosterEntry, key: &str) -> bool {
    match entry.get(key) {
        Some(Json::Bool(b)) => *b,
        Some(value) => value.as_i64().is_some_and(|v| v != 0),
        None => false,
    }
}

fn entry_string(entry: &RosterEntry, key: &str) -> String {
    entry
        .get(key)
        .and_then(Json::as_str)
        .map(fix_latin1)
        .unwrap_or_default()
}

/// Names decoded as latin-1 that are really UTF-8 bytes.
fn fix_latin1(s: &str) -> String {
    if s.is_ascii() || s.chars().any(|c| c as u32 > 0xff) {
        return s.to_owned();
    }
    let raw: Vec<u8> = s.chars().map(|c| c as u8).collect();
    String::from_utf8(raw).unwrap_or_else(|_| s.to_owned())
}

fn task_info(task: &ArgValue) -> TaskInfo {
    let id = |name: &str| task.get(name).and_then(ArgValue::as_i64).unwrap_or(-1);
    let named = |name: Option<String>, raw: i64| name.unwrap_or_else(|| raw.to_string());
    let category = id("category");
    let status = id("status");
    let task_type = id("type");
    TaskInfo {
        category: named(
            u8::try_from(category)
                .ok()
                .and_then(TaskCategory::from_repr)
                .map(|c| c.to_string()),
            category,
        ),
        status: named(
            u8::try_from(status)
                .ok()
                .and_then(TaskStatus::from_repr)
                .map(|s| s.to_string()),
            status,
        ),
        name: task
            .get("name")
            .and_then(ArgValue::as_str)
            .unwrap_or_default()
            .to_owned(),
        task_type: named(
            u8::try_from(task_type)
                .ok()
                .and_then(TaskType::from_repr)
                .map(|t| t.to_string()),
            task_type,
        ),
    }
}

fn parse_ship_config<'a>(blob: &'a [u8], version: &Version) -> IResult<&'a [u8], ShipConfig> {
    let i = blob;
    let (i, _unk) = le_u32(i)?;

    let (i, ship_params_id) = le_u32(i)?;
    let (i, _unk2) = le_u32(i)?;

    let (i, unit_count) = le_u32(i)?;
    let (i, units) = count(le_u32, unit_count as usize)(i)?;

    let i = if version.is_at_least(&Version::new(13, 2, 0, 0)) {
        let (i, _unk) = le_u32(i)?;
        i
    } else {
        i
    };

    let (i, modernization_count) = le_u32(i)?;
    let (i, modernization) = count(le_u32, modernization_count as usize)(i)?;

    let (i, signal_count) = le_u32(i)?;
    let (i, signals) = count(le_u32, signal_count as usize)(i)?;

    let (i, _supply_state) = le_u32(i)?;

    let (i, camo_info_count) = le_u32(i)?;
    // (camo, scheme)
    let (i, _camo) = count(pair(le_u32, le_u32), camo_info_count as usize)(i)?;

    let (i, abilities_count) = le_u32(i)?;
    let (i, abilities) = count(le_u32, abilities_count as usize)(i)?;

    Ok((
        i,
        ShipConfig {
            ship_params_id,
            abilities,
            hull: units.first().copied().unwrap_or_default(),
            modernization,
            units,
            signals,
        },
    ))
}

// BattleLogic

fn on_time_left(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    c.time_left = int(value, "timeLeft")?;
    if c.stage == BattleStage::Active {
        c.commit_tick(entity);
    }
    Ok(())
}

fn on_duration(c: &mut BattleController, _: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    c.durations.push(int(value, "duration")?);
    Ok(())
}

fn on_battle_stage(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let stage = int(value, "battleStage")?;
    c.battle_stage = stage;
    match c.stage {
        BattleStage::Ended => {}
        _ if stage == 0 => {
            if c.stage != BattleStage::Active {
                debug!("battle active at {}", c.clock);
            }
            c.stage = BattleStage::Active;
        }
        BattleStage::Active => {
            debug!("battle ended at {} (stage {})", c.clock, stage);
            c.stage = BattleStage::Ended;
            c.flush_last_frame(Some(entity));
        }
        BattleStage::Loading => {}
    }
    Ok(())
}

fn on_battle_result(c: &mut BattleController, _: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    c.result = BattleResult {
        team_id: int(field(value, "winnerTeamId")?, "winnerTeamId")?,
        victory_type: int(field(value, "finishReason")?, "finishReason")?,
    };
    Ok(())
}

fn on_battle_state(c: &mut BattleController, _: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let missions = field(value, "missions")?;
    c.win_score = int(field(missions, "teamWinScore")?, "teamWinScore")?;
    for team_score in list(field(missions, "teamsScore")?, "teamsScore")? {
        c.set_score(team_score)?;
    }
    Ok(())
}

fn on_battle_type(c: &mut BattleController, _: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    c.battle_type = int(value, "battleType")?;
    Ok(())
}

fn on_team_score(c: &mut BattleController, _: &Entity, leaf: &ArgValue) -> Result<(), ErrorKind> {
    match leaf {
        ArgValue::FixedDict(_) => c.set_score(leaf),
        ArgValue::Array(scores) => scores.items.iter().try_for_each(|score| c.set_score(score)),
        _ => Ok(()),
    }
}

// Vehicle

fn on_health(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let health = float(value, "health")?;
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| v.health = health)
}

fn on_vehicle_alive(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let is_alive = flag(value, "isAlive")?;
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| v.is_alive = is_alive)
}

fn on_invisible(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let not_in_range = flag(value, "isInvisible")?;
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| {
        v.not_in_range = not_in_range
    })
}

fn on_ship_config(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let (_, config) = parse_ship_config(bytes(value, "shipConfig")?, &c.version)?;
    let Some(&player_id) = c.vehicle_to_id.get(&entity_key(entity)) else {
        trace!("ship config for unknown vehicle {}", entity.id());
        return Ok(());
    };
    replace_in(&mut c.info, "player_info", player_id, |info| {
        info.abilities = config.abilities.clone();
        info.hull = Some(config.hull);
        info.modernization = config.modernization.clone();
        info.units = Some(Units::from_slice(&config.units));
        info.signals = Some(config.signals.clone());
    })
}

fn on_crew_params(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let lists = list(field(value, "learnedSkills")?, "learnedSkills")?
        .iter()
        .map(|skills| {
            list(skills, "learnedSkills")?
                .iter()
                .map(|skill| int(skill, "skill").map(|id| id as u8))
                .collect::<Result<Vec<u8>, ErrorKind>>()
        })
        .collect::<Result<Vec<_>, _>>()?;
    let player_id = c.player_for_vehicle(entity_key(entity))?;
    replace_in(&mut c.info, "player_info", player_id, |info| {
        info.skills = Skills::from_lists(lists)
    })
}

fn on_visibility_flags(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let flags = int(value, "visibilityFlags")?;
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| v.visibility_flag = flags)
}

fn on_regenerated_health(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let health = float(value, "regeneratedHealth")?;
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| {
        v.regenerated_health = health
    })
}

fn on_regen_crew_hp_limit(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let limit = float(value, "regenCrewHpLimit")?;
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| {
        v.regen_crew_hp_limit = limit
    })
}

fn on_regeneration_health(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let health = float(value, "regenerationHealth")?;
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| {
        v.regeneration_health = health
    })
}

fn on_burning_flags(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let flags = int(value, "burningFlags")?;
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| v.burn_flags = flags)
}

fn on_max_health(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let max_health = float(value, "maxHealth")?;
    let player_id = c.player_for_vehicle(entity_key(entity))?;
    replace_in(&mut c.info, "player_info", player_id, |info| {
        info.max_health = max_health
    })
}

fn on_set_consumables(c: &mut BattleController, entity: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [blob] = args.expect::<1>("setConsumables")?;
    let consumables = unpickle(bytes(blob, "setConsumables")?, "consumables")?;
    let mut state = BTreeMap::new();
    if let pickled::value::Value::List(items) = &consumables {
        for item in items.inner().iter() {
            let pair = match item {
                pickled::value::Value::Tuple(pair) => pair.inner().clone(),
                pickled::value::Value::List(pair) => pair.inner().clone(),
                _ => continue,
            };
            if let [pickled::value::Value::I64(id), value] = pair.as_slice() {
                state.insert(*id, super::players::pickle_to_json(value));
            }
        }
    }
    replace_in(&mut c.vehicles, "vehicle", entity_key(entity), |v| {
        v.consumables_state = state
    })
}

fn on_consumable_used(c: &mut BattleController, entity: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [consumable_id, duration] = args.expect::<2>("consumableUsed")?;
    let consumable = Consumable {
        ship_id: entity.id(),
        consumable_id: int(consumable_id, "consumableId")?,
        duration: float(duration, "duration")?,
    };
    c.acc_consumables
        .entry(entity.id())
        .or_default()
        .push(consumable);
    Ok(())
}

fn on_damages_on_ship(c: &mut BattleController, entity: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [damages] = args.expect::<1>("receiveDamagesOnShip")?;
    for damage in list(damages, "damages")? {
        let attacker = int(field(damage, "vehicleID")?, "vehicleID")?;
        let amount = float(field(damage, "damage")?, "damage")?;
        *c.shots_damage_map
            .entry(entity.id())
            .or_default()
            .entry(attacker)
            .or_default() += amount;
    }
    Ok(())
}

// Building

fn on_building_suppressed(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let is_suppressed = flag(value, "isSuppressed")?;
    replace_in(&mut c.buildings, "building", entity_key(entity), |b| {
        b.is_suppressed = is_suppressed
    })
}

fn on_building_alive(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    let is_alive = flag(value, "isAlive")?;
    replace_in(&mut c.buildings, "building", entity_key(entity), |b| b.is_alive = is_alive)
}

// InteractiveZone

fn on_components_state(c: &mut BattleController, entity: &Entity, value: &ArgValue) -> Result<(), ErrorKind> {
    c.refresh_control_point(entity, value)
}

fn on_capture_logic(c: &mut BattleController, entity: &Entity, _leaf: &ArgValue) -> Result<(), ErrorKind> {
    let Some(state) = entity.client_property("componentsState") else {
        return Ok(());
    };
    c.refresh_control_point(entity, state)
}

// SmokeScreen

fn on_smoke_points(c: &mut BattleController, entity: &Entity, _leaf: &ArgValue) -> Result<(), ErrorKind> {
    let Some(points) = entity.client_property("points") else {
        return Ok(());
    };
    let points = smoke_points(points)?;
    replace_in(&mut c.smokes, "smoke", entity_key(entity), |s| s.points = points)
}

// Avatar

fn on_arena_state_received(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [arena_id, _team_build_type, _pre_battles, players, bots, observers, buildings] =
        args.expect::<7>("onArenaStateReceived")?;
    c.arena_id = int(arena_id, "arenaUniqueId")?;
    c.update_roster(players, PlayerType::Player)?;
    c.update_roster(bots, PlayerType::Bot)?;
    c.update_roster(buildings, PlayerType::Building)?;
    c.update_roster(observers, PlayerType::Observer)?;
    c.create_player_vehicle_data();
    Ok(())
}

fn on_game_room_state_changed(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [players, bots, observers] = args.expect::<3>("onGameRoomStateChanged")?;
    c.update_roster(players, PlayerType::Player)?;
    c.update_roster(bots, PlayerType::Bot)?;
    c.update_roster(observers, PlayerType::Observer)
}

fn on_new_player_spawned(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [players, bots, observers] = args.expect::<3>("onNewPlayerSpawnedInBattle")?;
    c.update_roster(players, PlayerType::Player)?;
    c.update_roster(bots, PlayerType::Bot)?;
    c.update_roster(observers, PlayerType::Observer)?;
    c.create_player_vehicle_data();
    Ok(())
}

fn on_vehicle_death(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [killed, fragger, death_type] = args.expect::<3>("receiveVehicleDeath")?;
    let frag = Frag {
        killed_id: int(killed, "killedVehicleId")?,
        fragger_id: int(fragger, "fraggerVehicleId")?,
        death_type: int(death_type, "typeDeath")?,
    };
    debug!(
        "vehicle {} killed by {} at {}",
        frag.killed_id, frag.fragger_id, c.clock
    );
    c.death_map.push(frag.clone());
    c.acc_frags.push(frag);
    Ok(())
}

fn on_achievement_earned(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [avatar_id, achievement_id] = args.expect::<2>("onAchievementEarned")?;
    *c.achievements
        .entry(int(avatar_id, "avatarId")?)
        .or_default()
        .entry(int(achievement_id, "achievementId")?)
        .or_default() += 1;
    Ok(())
}

fn on_damage_stat(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    use pickled::value::{HashableValue, Value};

    let [blob] = args.expect::<1>("receiveDamageStat")?;
    let Value::Dict(stats) = unpickle(bytes(blob, "receiveDamageStat")?, "damage stats")? else {
        return Err(ErrorKind::Pickle {
            what: "damage stats",
            reason: "expected a dict".to_owned(),
        });
    };

    for (key, value) in stats.inner().iter() {
        let HashableValue::Tuple(key) = key else {
            continue;
        };
        let key = key.inner();
        let (Some(weapon), Some(kind)) = (
            key.first().and_then(hashable_i64),
            key.get(1).and_then(hashable_i64).and_then(DamageStatsType::from_id),
        ) else {
            trace!("unexpected damage stat key {:?}", key);
            continue;
        };
        let values = match value {
            Value::List(items) => items.inner().iter().filter_map(pickle_f64).collect(),
            Value::Tuple(items) => items.inner().iter().filter_map(pickle_f64).collect(),
            _ => Vec::new(),
        };
        c.damage_maps.entry(kind).or_default().insert(weapon, values);
    }
    Ok(())
}

fn pickle_f64(value: &pickled::value::Value) -> Option<f64> {
    match value {
        pickled::value::Value::I64(i) => Some(*i as f64),
        pickled::value::Value::F64(f) => Some(*f),
        _ => None,
    }
}

fn on_plane_death(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [_squadron, plane_ids, _reason, attacker] = args.expect::<4>("receive_planeDeath")?;
    let killed = list(plane_ids, "planeIDs")?.len() as i64;
    *c.dead_planes.entry(int(attacker, "attackerId")?).or_default() += killed;
    Ok(())
}

fn on_minimap_vision(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [ships, buildings] = args.expect::<2>("updateMinimapVisionInfo")?;
    let buildings = list(buildings, "buildingsMinimapDiff")?
        .iter()
        .map(minimap_update)
        .collect::<Result<Vec<_>, _>>()?;
    let ships = list(ships, "shipsMinimapDiff")?
        .iter()
        .map(minimap_update)
        .collect::<Result<Vec<_>, _>>()?;

    for (id, pos) in buildings {
        let result = replace_in(&mut c.buildings, "building", id, |b| {
            b.is_visible = !pos.is_hidden();
            if b.is_visible {
                b.x = round(pos.x);
                b.y = round(pos.y);
                b.yaw = round(pos.yaw.to_degrees());
            }
        });
        if let Err(err) = result {
            trace!("{}", err);
        }
    }

    for (id, pos) in ships {
        let result = replace_in(&mut c.vehicles, "vehicle", id, |v| {
            v.is_visible = !pos.is_hidden();
            if v.is_visible {
                v.x = round(pos.x);
                v.y = round(pos.y);
                v.yaw = round(pos.yaw.to_degrees());
            }
        });
        if let Err(err) = result {
            trace!("{}", err);
        }
    }
    Ok(())
}

fn minimap_update(update: &ArgValue) -> Result<(i64, MinimapPosition), ErrorKind> {
    let id = int(field(update, "vehicleID")?, "vehicleID")?;
    let packed = int(field(update, "packedData")?, "packedData")?;
    Ok((id, MinimapPosition::unpack(packed as u32)))
}

fn on_artillery_shots(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [salvos] = args.expect::<1>("receiveArtilleryShots")?;
    let mut shots = Vec::new();
    for salvo in list(salvos, "shots")? {
        let owner_id = int(field(salvo, "ownerID")?, "ownerID")?;
        let params_id = int(field(salvo, "paramsID")?, "paramsID")?;
        for shell in list(field(salvo, "shots")?, "shots")? {
            let flight = float(field(shell, "serverTimeLeft")?, "serverTimeLeft")?;
            shots.push(Shot {
                owner_id,
                params_id,
                origin: grid(field(shell, "pos")?, "pos")?,
                destination: grid(field(shell, "tarPos")?, "tarPos")?,
                shot_id: concat_ids(owner_id, int(field(shell, "shotID")?, "shotID")?)?,
                t_time: round(flight / SHELL_TIME_SCALE),
            });
        }
    }
    c.acc_shots.extend(shots);
    Ok(())
}

fn on_torpedoes(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [salvos] = args.expect::<1>("receiveTorpedoes")?;
    let mut torpedoes = Vec::new();
    for salvo in list(salvos, "torpedoes")? {
        let owner_id = int(field(salvo, "ownerID")?, "ownerID")?;
        let params_id = int(field(salvo, "paramsID")?, "paramsID")?;
        for torpedo in list(field(salvo, "torpedoes")?, "torpedoes")? {
            let (a, b) = planar(field(torpedo, "dir")?, "dir")?;
            let shot_id = concat_ids(owner_id, int(field(torpedo, "shotID")?, "shotID")?)?;
            torpedoes.push(Torpedo {
                owner_id,
                params_id,
                origin: grid(field(torpedo, "pos")?, "pos")?,
                shot_id,
                yaw: a.atan2(b),
                speed_bw: a.hypot(b),
            });
        }
    }
    c.acc_torpedoes
        .extend(torpedoes.into_iter().map(|torpedo| (torpedo.shot_id, torpedo)));
    Ok(())
}

fn on_shot_kills(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [hits] = args.expect::<1>("receiveShotKills")?;
    let mut killed = Vec::new();
    for item in list(hits, "shotKills")? {
        let owner_id = int(field(item, "ownerID")?, "ownerID")?;
        for kill in list(field(item, "kills")?, "kills")? {
            let shot_id = int(field(kill, "shotID")?, "shotID")?;
            killed.push(concat_ids(owner_id, shot_id)?);
        }
    }
    c.acc_hits.extend(killed);
    Ok(())
}

fn on_add_squadron(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [plane_id, team_id, params_id, pos, _unknown] =
        args.expect::<5>("receive_addMinimapSquadron")?;
    let plane_id = int(plane_id, "planeId")?;
    let team_id = int(team_id, "teamId")?;
    let unpacked = PlaneId::unpack(plane_id as u64);

    let known = c
        .vehicle_to_id
        .get(&(unpacked.owner_id as i64))
        .and_then(|player_id| c.info.get(player_id))
        .map(|info| info.relation);
    let relation = match known {
        Some(relation) => relation,
        None => Relation::from_teams(team_id, c.owner_team()?),
    };

    c.planes.insert(
        plane_id,
        Plane {
            plane_id,
            owner_id: unpacked.owner_id,
            params_id: int(params_id, "paramsId")?,
            index: unpacked.index,
            purpose: unpacked.purpose,
            departures: unpacked.departures,
            relation,
            position: grid(pos, "squadron position")?,
        },
    );
    Ok(())
}

fn on_update_squadron(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [plane_id, pos] = args.expect::<2>("receive_updateMinimapSquadron")?;
    let position = grid(pos, "squadron position")?;
    replace_in(&mut c.planes, "plane", int(plane_id, "planeId")?, |p| {
        p.position = position
    })
}

fn on_remove_squadron(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [plane_id] = args.expect::<1>("receive_removeMinimapSquadron")?;
    let plane_id = int(plane_id, "planeId")?;
    c.planes
        .remove(&plane_id)
        .map(|_| ())
        .ok_or(ErrorKind::MissingRecord {
            table: "plane",
            id: plane_id,
        })
}

fn on_ward_added(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [plane_id, position, radius, _duration, _team_id, vehicle_id] =
        args.expect::<6>("receive_wardAdded")?;
    let plane_id = int(plane_id, "planeId")?;
    let vehicle_id = int(vehicle_id, "vehicleId")?;
    let radius = match float(radius, "radius")? {
        r if r == 0.0 => DEFAULT_WARD_RADIUS,
        r => r,
    };
    let player_id = c.player_for_vehicle(vehicle_id)?;
    let relation = c
        .info
        .get(&player_id)
        .map(|info| info.relation)
        .ok_or(ErrorKind::MissingRecord {
            table: "player_info",
            id: player_id,
        })?;

    c.wards.insert(
        plane_id,
        Ward {
            plane_id,
            vehicle_id,
            position: grid(position, "ward position")?,
            radius,
            relation,
        },
    );
    Ok(())
}

fn on_ward_removed(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [plane_id] = args.expect::<1>("receive_wardRemoved")?;
    let plane_id = int(plane_id, "planeId")?;
    c.wards
        .remove(&plane_id)
        .map(|_| ())
        .ok_or(ErrorKind::MissingRecord {
            table: "ward",
            id: plane_id,
        })
}

fn on_chat_message(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [player_id, namespace, message, _unknown] = args.expect::<4>("onChatMessage")?;
    let player_id = int(player_id, "playerId")?;
    if player_id == 0 || player_id == -1 {
        return Ok(());
    }
    let text = |value: &ArgValue| match value {
        ArgValue::String(s) => s.clone(),
        other => other
            .as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default(),
    };
    let message = Message {
        player_id,
        namespace: text(namespace),
        message: text(message),
    };
    debug!("chat from {} in {}: {}", player_id, message.namespace, message.message);
    c.acc_messages.push(message);
    Ok(())
}

fn on_torpedo_direction(c: &mut BattleController, _: &Entity, args: &MethodArgs) -> Result<(), ErrorKind> {
    let [owner, torpedo, pos, target_yaw, _depth, _speed, yaw_speed, _pitch_speed, _reach] =
        args.expect::<9>("receiveTorpedoDirection")?;
    let vehicle_id = int(owner, "ownerId")?;
    let id = concat_ids(vehicle_id, int(torpedo, "torpedoId")?)?;
    let (x, y) = grid(pos, "serverPos")?;
    c.acc_acoustic_torpedoes.insert(
        id,
        AcousticTorpedo {
            vehicle_id,
            id,
            x,
            y,
            t_yaw: float(target_yaw, "targetYaw")?,
            cur_yaw_speed: float(yaw_speed, "curYawSpeed")?,
        },
    );
    Ok(())
}

fn on_ribbons(c: &mut BattleController, entity: &Entity, leaf: &ArgValue) -> Result<(), ErrorKind> {
    let mut update = |ribbon: &ArgValue| -> Result<(), ErrorKind> {
        let id = int(field(ribbon, "ribbonId")?, "ribbonId")?;
        let count = int(field(ribbon, "count")?, "count")?;
        let current = c.ribbons.entry(entity.id()).or_default().entry(id).or_default();
        *current = (*current).max(count);
        Ok(())
    };
    match leaf {
        ArgValue::FixedDict(_) => update(leaf),
        ArgValue::Array(ribbons) => ribbons.items.iter().try_for_each(update),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::zone;
    use crate::game_constants::ROSTER_FIELDS_14_2;

    fn controller() -> BattleController {
        BattleController::new(Version::new(13, 0, 0, 0), &ROSTER_FIELDS_14_2)
    }

    fn args(values: Vec<ArgValue>) -> MethodArgs {
        MethodArgs::new(vec![None; values.len()], values)
    }

    fn active(c: &mut BattleController, entity: &Entity) {
        on_duration(c, entity, &ArgValue::Uint16(1200)).unwrap();
        on_battle_stage(c, entity, &ArgValue::Uint8(0)).unwrap();
    }

    fn owner_on_team(c: &mut BattleController, team: i64) {
        let mut owner = RosterEntry::new();
        owner.insert("teamId".to_owned(), Json::from(team));
        owner.insert("avatarId".to_owned(), Json::from(1));
        owner.insert("id".to_owned(), Json::from(100));
        owner.insert("shipId".to_owned(), Json::from(7));
        c.owner = Some(owner);
    }

    fn vehicle(id: i64) -> Vehicle {
        Vehicle {
            player_id: id + 100,
            vehicle_id: id,
            health: 1000.0,
            is_alive: true,
            x: -2500,
            y: -2500,
            yaw: -180,
            relation: Relation::Enemy,
            is_visible: false,
            not_in_range: false,
            visibility_flag: 0,
            burn_flags: 0,
            consumables_state: BTreeMap::new(),
            regenerated_health: 0.0,
            regen_crew_hp_limit: 0.0,
            regeneration_health: 0.0,
        }
    }

    #[test]
    fn ticks_commit_only_while_active() {
        let mut c = controller();
        let logic = zone();

        on_duration(&mut c, &logic, &ArgValue::Uint16(1200)).unwrap();
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1200)).unwrap();
        assert!(c.events.is_empty());

        on_battle_stage(&mut c, &logic, &ArgValue::Uint8(0)).unwrap();
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1200)).unwrap();
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1199)).unwrap();
        assert_eq!(c.events.keys().copied().collect::<Vec<_>>(), [0, 1]);
        assert_eq!(c.events[&1].time_left, 1199);
    }

    #[test]
    fn frag_lands_in_the_next_second_only() {
        let mut c = controller();
        let logic = zone();
        active(&mut c, &logic);

        on_time_left(&mut c, &logic, &ArgValue::Uint16(1200)).unwrap();
        on_vehicle_death(
            &mut c,
            &logic,
            &args(vec![ArgValue::Int32(7), ArgValue::Int32(8), ArgValue::Uint8(17)]),
        )
        .unwrap();
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1199)).unwrap();
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1198)).unwrap();

        assert!(c.events[&0].frag.is_empty());
        assert_eq!(c.events[&1].frag.len(), 1);
        assert!(c.events[&2].frag.is_empty());

        let timeline = c.finish(None);
        assert_eq!(timeline.death_info[&7].killer_id, 8);
        assert_eq!(timeline.death_info[&7].name, "AP_SHELL");
    }

    #[test]
    fn repeated_second_keeps_accumulators() {
        let mut c = controller();
        let logic = zone();
        active(&mut c, &logic);

        on_time_left(&mut c, &logic, &ArgValue::Uint16(1190)).unwrap();
        on_achievement_earned(&mut c, &logic, &args(vec![ArgValue::Int32(1), ArgValue::Int32(4)]))
            .unwrap();
        on_vehicle_death(
            &mut c,
            &logic,
            &args(vec![ArgValue::Int32(7), ArgValue::Int32(8), ArgValue::Uint8(1)]),
        )
        .unwrap();
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1190)).unwrap();
        assert_eq!(c.events.len(), 1);
        assert!(c.events[&10].frag.is_empty());

        on_time_left(&mut c, &logic, &ArgValue::Uint16(1189)).unwrap();
        assert_eq!(c.events[&11].frag.len(), 1);
        assert_eq!(c.events[&11].achievement[&1][&4], 1);
    }

    #[test]
    fn snapshots_are_not_affected_by_later_changes() {
        let mut c = controller();
        let logic = zone();
        active(&mut c, &logic);
        c.vehicles.insert(7, vehicle(7));

        on_time_left(&mut c, &logic, &ArgValue::Uint16(1200)).unwrap();
        on_health(&mut c, &logic, &ArgValue::Float32(250.0)).unwrap();
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1199)).unwrap();

        assert_eq!(c.events[&0].vehicle[&7].health, 1000.0);
        assert_eq!(c.events[&1].vehicle[&7].health, 250.0);
    }

    #[test]
    fn unknown_vehicle_is_a_semantic_error() {
        let mut c = controller();
        let err = on_health(&mut c, &zone(), &ArgValue::Float32(1.0)).unwrap_err();
        assert!(matches!(err, ErrorKind::MissingRecord { table: "vehicle", id: 7 }));
        assert!(!err.is_fatal(true));
    }

    #[test]
    fn wrong_arity_is_reported() {
        let mut c = controller();
        let err = on_vehicle_death(&mut c, &zone(), &args(vec![ArgValue::Int32(1)])).unwrap_err();
        assert!(matches!(
            err,
            ErrorKind::HandlerArity {
                handler: "receiveVehicleDeath",
                expected: 3,
                got: 1
            }
        ));
    }

    #[test]
    fn hidden_minimap_position_only_clears_visibility() {
        let mut c = controller();
        let mut seen = vehicle(7);
        seen.x = 100;
        seen.y = 200;
        seen.is_visible = true;
        c.vehicles.insert(7, seen);

        // x = y = 0, yaw = 127
        let hidden = ArgValue::Uint32(0x7f << 22);
        let update = crate::rpc::typedefs::tests::fixed_dict(&[
            ("vehicleID", ArgValue::Int32(7)),
            ("packedData", hidden),
        ]);
        let ships = crate::rpc::typedefs::tests::array(vec![update]);
        let buildings = crate::rpc::typedefs::tests::array(vec![]);
        on_minimap_vision(&mut c, &zone(), &args(vec![ships, buildings])).unwrap();

        let v = &c.vehicles[&7];
        assert!(!v.is_visible);
        assert_eq!((v.x, v.y), (100, 200));
    }

    #[test]
    fn malformed_list_entry_drops_the_whole_update() {
        use crate::rpc::typedefs::tests::{array, fixed_dict};

        let mut c = controller();
        c.vehicles.insert(7, vehicle(7));
        let visible = fixed_dict(&[
            ("vehicleID", ArgValue::Int32(7)),
            ("packedData", ArgValue::Uint32(0x1000)),
        ]);
        let broken = fixed_dict(&[("vehicleID", ArgValue::Int32(8))]);
        let err = on_minimap_vision(
            &mut c,
            &zone(),
            &args(vec![array(vec![visible, broken]), array(vec![])]),
        )
        .unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Decode);
        assert_eq!(c.vehicles[&7], vehicle(7));

        let shell = fixed_dict(&[
            ("pos", ArgValue::Vector3((10.0, 0.0, 20.0))),
            ("tarPos", ArgValue::Vector3((30.0, 0.0, 40.0))),
            ("shotID", ArgValue::Int32(1)),
            ("serverTimeLeft", ArgValue::Float32(2.0)),
        ]);
        let no_target = fixed_dict(&[
            ("pos", ArgValue::Vector3((10.0, 0.0, 20.0))),
            ("shotID", ArgValue::Int32(2)),
            ("serverTimeLeft", ArgValue::Float32(2.0)),
        ]);
        let salvo = fixed_dict(&[
            ("ownerID", ArgValue::Int32(5)),
            ("paramsID", ArgValue::Uint32(9)),
            ("shots", array(vec![shell, no_target])),
        ]);
        assert!(on_artillery_shots(&mut c, &zone(), &args(vec![array(vec![salvo])])).is_err());
        assert!(c.acc_shots.is_empty());
    }

    #[test]
    fn trailing_events_flush_after_the_last_second() {
        let mut c = controller();
        let logic = zone();
        active(&mut c, &logic);
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1100)).unwrap();
        on_consumable_used(
            &mut c,
            &logic,
            &args(vec![ArgValue::Int8(3), ArgValue::Float32(20.0)]),
        )
        .unwrap();

        on_battle_stage(&mut c, &logic, &ArgValue::Uint8(3)).unwrap();
        assert_eq!(c.stage(), BattleStage::Ended);
        assert!(c.events[&101].last_frame);
        assert_eq!(c.events[&101].consumable[&EntityId(7)].len(), 1);

        // ended is terminal
        on_battle_stage(&mut c, &logic, &ArgValue::Uint8(0)).unwrap();
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1000)).unwrap();
        assert_eq!(c.stage(), BattleStage::Ended);
        assert_eq!(c.events.len(), 2);
    }

    #[test]
    fn nothing_to_flush_adds_no_frame() {
        let mut c = controller();
        let logic = zone();
        active(&mut c, &logic);
        on_time_left(&mut c, &logic, &ArgValue::Uint16(1100)).unwrap();
        let timeline = c.finish(None);
        assert_eq!(timeline.span(), Some((100, 100)));
        assert!(!timeline.events[&100].last_frame);
    }

    #[test]
    fn scores_are_relative_to_the_owner() {
        let mut c = controller();
        let err = on_team_score(
            &mut c,
            &zone(),
            &crate::rpc::typedefs::tests::fixed_dict(&[
                ("teamId", ArgValue::Int8(0)),
                ("score", ArgValue::Int32(300)),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, ErrorKind::OwnerUnknown));

        owner_on_team(&mut c, 1);
        for (team, score) in [(0, 300), (1, 450)] {
            on_team_score(
                &mut c,
                &zone(),
                &crate::rpc::typedefs::tests::fixed_dict(&[
                    ("teamId", ArgValue::Int8(team)),
                    ("score", ArgValue::Int32(score)),
                ]),
            )
            .unwrap();
        }
        assert_eq!(c.scores[&Relation::Ally].score, 450);
        assert_eq!(c.scores[&Relation::Enemy].score, 300);
    }

    #[test]
    fn ribbon_counts_never_drop() {
        let mut c = controller();
        for count in [5, 2, 6] {
            let ribbon = crate::rpc::typedefs::tests::fixed_dict(&[
                ("ribbonId", ArgValue::Int8(3)),
                ("count", ArgValue::Int16(count)),
            ]);
            on_ribbons(&mut c, &zone(), &crate::rpc::typedefs::tests::array(vec![ribbon])).unwrap();
            let expected = if count == 2 { 5 } else { count as i64 };
            assert_eq!(c.ribbons[&EntityId(7)][&3], expected);
        }
    }

    #[test]
    fn time_to_win_estimate() {
        assert_eq!(time_to_win(0.0, 5.0, 100), -1.0);
        assert_eq!(time_to_win(6.0, 5.0, 600), 500.0);
    }

    #[test]
    fn ids_and_rounding() {
        assert_eq!(concat_ids(123, 45).unwrap(), 12345);
        assert_eq!(concat_ids(123, 0).unwrap(), 1230);
        assert_eq!(concat_ids(-1, 5).unwrap(), -15);
        let err = concat_ids(i64::MAX / 10, 45).unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Decode);
        assert!(concat_ids(1, -3).is_err());
        assert_eq!(round(2.5), 2);
        assert_eq!(round(3.5), 4);
        assert_eq!(round(-2.5), -2);
        assert_eq!(fix_latin1("Ã©"), "é");
        assert_eq!(fix_latin1("plain"), "plain");
    }

    #[test]
    fn ship_config_layout_depends_on_version() {
        let mut blob = Vec::new();
        let mut put = |v: u32| blob.extend_from_slice(&v.to_le_bytes());
        put(0);
        put(4_000_000_001); // ship params id
        put(0);
        put(2); // units
        put(11);
        put(12);
        put(99); // extra field since 13.2
        put(1); // modernization
        put(21);
        put(1); // signals
        put(31);
        put(0); // supply state
        put(1); // camo
        put(41);
        put(42);
        put(2); // abilities
        put(51);
        put(52);

        let (rest, config) = parse_ship_config(&blob, &Version::new(13, 2, 0, 0)).unwrap();
        assert!(rest.is_empty());
        assert_eq!(config.ship_params_id, 4_000_000_001);
        assert_eq!(config.hull, 11);
        assert_eq!(config.modernization, [21]);
        assert_eq!(config.signals, [31]);
        assert_eq!(config.abilities, [51, 52]);

        // older layouts read the extra field as the modernization count
        assert!(parse_ship_config(&blob, &Version::new(13, 1, 0, 0)).is_err());
    }

    #[test]
    fn map_and_version_names() {
        let mut c = controller();
        c.on_map(&MapPacket {
            space_id: 1,
            arena_id: 2,
            name: "spaces/16_OC_bees_to_honey".to_owned(),
        });
        c.on_version("13,0,0,7851390,0");
        let timeline = c.finish(None);
        assert_eq!(timeline.map, "16_OC_bees_to_honey");
        assert_eq!(timeline.version, "13_0_0_7851390");
        assert_eq!(timeline.owner_id, -1);
    }

    #[test]
    fn bindings_cover_every_entity_type() {
        let table = crate::entity::DispatchTable::new(BattleController::bindings());
        assert!(table.has_method_handlers("Avatar", "receiveVehicleDeath"));
        assert_eq!(table.property_handlers("BattleLogic", "timeLeft").len(), 1);
        assert_eq!(table.property_handlers("Vehicle", "maxHealth").len(), 1);
        assert_eq!(
            table
                .nested_handlers("InteractiveZone", "componentsState.captureLogic")
                .count(),
            1
        );
        assert!(!table.has_method_handlers("Avatar", "onBattleEnd"));
    }
}
