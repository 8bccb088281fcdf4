use std::collections::BTreeMap;

use serde::Serialize;

use super::state::{
    AcousticTorpedo, Building, BuildingInfo, Consumable, ControlPoint, Frag, Message, Plane,
    PlayerInfo, Score, Shot, Smoke, Torpedo, Vehicle, Ward,
};
use crate::game_constants::DamageStatsType;
use crate::types::{EntityId, Relation};

/// `damage_maps[kind][weapon type] = (damage, count, ...)`
pub type DamageMaps = BTreeMap<DamageStatsType, BTreeMap<i64, Vec<f64>>>;

/// Everything known at one battle second. Persistent tables are full copies;
/// the lists hold only what happened since the previous snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Events {
    pub time_left: i64,
    pub vehicle: BTreeMap<i64, Vehicle>,
    pub building: BTreeMap<i64, Building>,
    pub plane: BTreeMap<i64, Plane>,
    pub ward: BTreeMap<i64, Ward>,
    pub smoke: BTreeMap<i64, Smoke>,
    pub shot: Vec<Shot>,
    pub torpedo: BTreeMap<i64, Torpedo>,
    pub hits: Vec<i64>,
    pub consumable: BTreeMap<EntityId, Vec<Consumable>>,
    pub control: BTreeMap<i64, ControlPoint>,
    pub score: BTreeMap<Relation, Score>,
    pub damage_maps: DamageMaps,
    pub frag: Vec<Frag>,
    pub ribbon: BTreeMap<EntityId, BTreeMap<i64, i64>>,
    pub achievement: BTreeMap<i64, BTreeMap<i64, i64>>,
    /// Estimated seconds until (ally, enemy) win on points, `-1` if not gaining.
    pub times_to_win: Option<(f64, f64)>,
    pub chat: Vec<Message>,
    pub acoustic_torpedo: BTreeMap<i64, AcousticTorpedo>,
    /// Set on the snapshot flushed after the last tick.
    pub last_frame: bool,
}

/// Winning team and finish reason, `-1` until the battle is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BattleResult {
    pub team_id: i64,
    pub victory_type: i64,
}

impl Default for BattleResult {
    fn default() -> Self {
        BattleResult {
            team_id: -1,
            victory_type: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeathInfo {
    pub killer_id: i64,
    pub icon: &'static str,
    pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub category: String,
    pub status: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
}

/// The reconstructed battle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timeline {
    pub arena_id: i64,
    /// `13_0_0_7851390` style.
    pub version: String,
    pub map: String,
    pub battle_type: i64,
    pub win_score: i64,
    pub result: BattleResult,
    pub owner_avatar_id: i64,
    pub owner_vehicle_id: i64,
    pub owner_id: i64,
    pub player_info: BTreeMap<i64, PlayerInfo>,
    pub building_info: BTreeMap<i64, BuildingInfo>,
    pub events: BTreeMap<i64, Events>,

    /// Raw roster entries, with `planesCount` added.
    pub players: BTreeMap<i64, serde_json::Map<String, serde_json::Value>>,
    pub achievements: BTreeMap<i64, BTreeMap<i64, i64>>,
    pub ribbons: BTreeMap<EntityId, BTreeMap<i64, i64>>,
    pub damage_maps: DamageMaps,
    /// Victim vehicle -> attacker vehicle -> damage.
    pub shots_damage_map: BTreeMap<EntityId, BTreeMap<i64, f64>>,
    pub death_info: BTreeMap<i64, DeathInfo>,
    pub control_points: serde_json::Value,
    pub tasks: Vec<TaskInfo>,
}

impl Timeline {
    /// Battle time of the first and last snapshot.
    pub fn span(&self) -> Option<(i64, i64)> {
        let first = self.events.keys().next()?;
        let last = self.events.keys().next_back()?;
        Some((*first, *last))
    }
}
