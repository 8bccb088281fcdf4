use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{EntityId, Relation};

/// Persistent records are never edited in place: a handler builds the next
/// version from the current one and swaps it into its table, so a snapshot
/// taken earlier keeps the old value.
pub trait Replace: Clone {
    fn replace(&self, update: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        update(&mut next);
        next
    }
}

/// Minimap grid position, already rounded.
pub type MapPos = (i64, i64);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vehicle {
    pub player_id: i64,
    pub vehicle_id: i64,
    pub health: f64,
    pub is_alive: bool,
    pub x: i64,
    pub y: i64,
    /// Degrees.
    pub yaw: i64,
    pub relation: Relation,
    pub is_visible: bool,
    pub not_in_range: bool,
    pub visibility_flag: i64,
    pub burn_flags: i64,
    /// Consumable id -> state tuple from the last `setConsumables`.
    pub consumables_state: BTreeMap<i64, serde_json::Value>,
    pub regenerated_health: f64,
    pub regen_crew_hp_limit: f64,
    pub regeneration_health: f64,
}

impl Replace for Vehicle {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Building {
    pub is_alive: bool,
    pub is_suppressed: bool,
    pub is_visible: bool,
    pub x: i64,
    pub y: i64,
    pub yaw: i64,
}

impl Replace for Building {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Smoke {
    pub entity_id: EntityId,
    pub radius: f64,
    pub points: Vec<(f64, f64)>,
}

impl Replace for Smoke {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plane {
    pub plane_id: i64,
    pub owner_id: u32,
    pub params_id: i64,
    pub index: u8,
    pub purpose: u8,
    pub departures: u8,
    pub relation: Relation,
    pub position: MapPos,
}

impl Replace for Plane {}

/// Fighter patrol circle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ward {
    pub plane_id: i64,
    pub vehicle_id: i64,
    pub position: MapPos,
    pub radius: f64,
    pub relation: Relation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlPoint {
    pub position: MapPos,
    pub radius: f64,
    pub team_id: i64,
    pub invader_team: i64,
    pub control_point_type: i64,
    /// (fraction captured, time remaining)
    pub progress: (f64, f64),
    pub both_inside: bool,
    pub has_invaders: bool,
    pub capture_time: f64,
    pub capture_speed: f64,
    pub relation: Relation,
    pub is_visible: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Score {
    pub relation: Relation,
    pub score: i64,
}

impl Replace for Score {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Shot {
    pub owner_id: i64,
    pub params_id: i64,
    pub origin: MapPos,
    pub destination: MapPos,
    pub shot_id: i64,
    /// Flight time in ticks.
    pub t_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Torpedo {
    pub owner_id: i64,
    pub params_id: i64,
    pub origin: MapPos,
    pub shot_id: i64,
    /// Heading in radians.
    pub yaw: f64,
    pub speed_bw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcousticTorpedo {
    pub vehicle_id: i64,
    pub id: i64,
    pub x: i64,
    pub y: i64,
    pub t_yaw: f64,
    pub cur_yaw_speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Consumable {
    pub ship_id: EntityId,
    pub consumable_id: i64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frag {
    pub killed_id: i64,
    pub fragger_id: i64,
    pub death_type: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub player_id: i64,
    pub namespace: String,
    pub message: String,
}

/// Module ids fitted to a ship, in the order the ship config lists them.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Units {
    pub hull: u32,
    pub artillery: u32,
    pub torpedoes: u32,
    pub suo: u32,
    pub engine: u32,
    pub flight_control: u32,
    pub fighter: u32,
    pub torpedo_bomber: u32,
    pub dive_bomber: u32,
    pub hydrophone: u32,
    pub skip_bomber: u32,
    pub primary_weapons: u32,
    pub secondary_weapons: u32,
    pub abilities: u32,
}

impl Units {
    pub fn from_slice(units: &[u32]) -> Self {
        let unit = |idx: usize| units.get(idx).copied().unwrap_or_default();
        Units {
            hull: unit(0),
            artillery: unit(1),
            torpedoes: unit(2),
            suo: unit(3),
            engine: unit(4),
            flight_control: unit(5),
            fighter: unit(6),
            torpedo_bomber: unit(7),
            dive_bomber: unit(8),
            hydrophone: unit(9),
            skip_bomber: unit(10),
            primary_weapons: unit(11),
            secondary_weapons: unit(12),
            abilities: unit(13),
        }
    }
}

/// Learned commander skills per ship class.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Skills {
    aircraft_carrier: Vec<u8>,
    battleship: Vec<u8>,
    cruiser: Vec<u8>,
    destroyer: Vec<u8>,
    auxiliary: Vec<u8>,
    submarine: Vec<u8>,
}

impl Skills {
    /// `learnedSkills` lists one skill list per class in this order.
    pub fn from_lists(mut lists: Vec<Vec<u8>>) -> Self {
        let mut next = || {
            if lists.is_empty() {
                Vec::new()
            } else {
                lists.remove(0)
            }
        };
        Skills {
            aircraft_carrier: next(),
            battleship: next(),
            cruiser: next(),
            destroyer: next(),
            auxiliary: next(),
            submarine: next(),
        }
    }

    pub fn submarine(&self) -> &[u8] {
        self.submarine.as_ref()
    }

    pub fn auxiliary(&self) -> &[u8] {
        self.auxiliary.as_ref()
    }

    pub fn destroyer(&self) -> &[u8] {
        self.destroyer.as_ref()
    }

    pub fn cruiser(&self) -> &[u8] {
        self.cruiser.as_ref()
    }

    pub fn battleship(&self) -> &[u8] {
        self.battleship.as_ref()
    }

    pub fn aircraft_carrier(&self) -> &[u8] {
        self.aircraft_carrier.as_ref()
    }
}

/// Parsed `shipConfig` blob.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ShipConfig {
    pub ship_params_id: u32,
    pub abilities: Vec<u32>,
    pub hull: u32,
    pub modernization: Vec<u32>,
    pub units: Vec<u32>,
    pub signals: Vec<u32>,
}

/// Static information about a player or bot, built from the roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayerInfo {
    pub id: i64,
    pub account_db_id: i64,
    pub clan_color: i64,
    pub clan_id: i64,
    pub clan_tag: String,
    pub max_health: f64,
    pub name: String,
    pub realm: String,
    pub ship_id: i64,
    pub team_id: i64,
    pub is_bot: bool,
    pub ship_params_id: i64,
    pub relation: Relation,
    pub hull: Option<u32>,
    pub abilities: Vec<u32>,
    pub modernization: Vec<u32>,
    pub skills: Skills,
    pub ship_components: serde_json::Value,
    pub units: Option<Units>,
    pub signals: Option<Vec<u32>>,
}

impl Replace for PlayerInfo {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildingInfo {
    pub id: i64,
    pub is_alive: bool,
    pub is_hidden: bool,
    pub is_suppressed: bool,
    pub name: String,
    pub params_id: i64,
    pub team_id: i64,
    pub unique_id: i64,
    pub relation: Relation,
    pub clan_tag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_leaves_the_original() {
        let score = Score {
            relation: Relation::Ally,
            score: 300,
        };
        let next = score.replace(|s| s.score = 450);
        assert_eq!(score.score, 300);
        assert_eq!(next.score, 450);
        assert_eq!(next.relation, Relation::Ally);
    }

    #[test]
    fn units_tolerate_short_configs() {
        let units = Units::from_slice(&[10, 20, 30]);
        assert_eq!(units.hull, 10);
        assert_eq!(units.torpedoes, 30);
        assert_eq!(units.abilities, 0);
    }

    #[test]
    fn skills_by_class() {
        let skills = Skills::from_lists(vec![vec![1], vec![2, 3], vec![], vec![4]]);
        assert_eq!(skills.aircraft_carrier(), [1]);
        assert_eq!(skills.battleship(), [2, 3]);
        assert_eq!(skills.destroyer(), [4]);
        assert!(skills.submarine().is_empty());
    }
}
