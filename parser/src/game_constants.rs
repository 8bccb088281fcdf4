//! Reference tables the battle controller needs to interpret server ids.

use serde::Serialize;
use strum_macros::{Display, EnumString, FromRepr, IntoStaticStr};

/// Cause of a ship's destruction as sent in `receiveVehicleDeath`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, IntoStaticStr, FromRepr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum DeathType {
    None = 0,
    Artillery = 1,
    Atba = 2,
    Torpedo = 3,
    Bomb = 4,
    Tbomb = 5,
    Burning = 6,
    Ram = 7,
    Terrain = 8,
    Flood = 9,
    Mirror = 10,
    SeaMine = 11,
    Special = 12,
    Dbomb = 13,
    Rocket = 14,
    Detonate = 15,
    Health = 16,
    ApShell = 17,
    HeShell = 18,
    CsShell = 19,
    Fel = 20,
    Portal = 21,
    SkipBomb = 22,
    SectorWave = 23,
    Acid = 24,
    Laser = 25,
    Match = 26,
    Timer = 27,
    Adbomb = 28,
    DbombMine = 29,
}

impl DeathType {
    pub fn from_id(id: i64) -> Option<Self> {
        u8::try_from(id).ok().and_then(DeathType::from_repr)
    }

    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Kill feed icon.
    pub fn icon(self) -> &'static str {
        use DeathType::*;
        match self {
            None | Artillery | Terrain | Mirror | Special | Health => "frags",
            Atba => "icon_frag_atba",
            Torpedo | Tbomb => "icon_frag_torpedo",
            Bomb => "icon_frag_bomb",
            Burning => "icon_frag_burning",
            Ram => "icon_frag_ram",
            Flood => "icon_frag_flood",
            SeaMine | DbombMine => "icon_frag_naval_mine",
            Dbomb | Adbomb => "icon_frag_depthbomb",
            Rocket => "icon_frag_rocket",
            Detonate => "icon_frag_detonate",
            ApShell | HeShell | CsShell => "icon_frag_main_caliber",
            Fel => "icon_frag_fel",
            Portal => "icon_frag_portal",
            SkipBomb => "icon_frag_skip",
            SectorWave => "icon_frag_wave",
            Acid => "icon_frag_acid",
            Laser => "icon_frag_laser",
            Match => "icon_frag_octagon",
            Timer => "icon_timer",
        }
    }
}

/// Buckets of `receiveDamageStat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Display, FromRepr)]
#[repr(u8)]
pub enum DamageStatsType {
    Enemy = 0,
    Ally = 1,
    Spot = 2,
    Agro = 3,
}

impl DamageStatsType {
    pub const ALL: [DamageStatsType; 4] = [
        DamageStatsType::Enemy,
        DamageStatsType::Ally,
        DamageStatsType::Spot,
        DamageStatsType::Agro,
    ];

    pub fn from_id(id: i64) -> Option<Self> {
        u8::try_from(id).ok().and_then(DamageStatsType::from_repr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, FromRepr)]
#[repr(u8)]
pub enum TaskCategory {
    Primary = 1,
    Secondary = 2,
    Tertiary = 3,
    Challenge = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, FromRepr)]
#[repr(u8)]
pub enum TaskStatus {
    NotStarted = 0,
    InProgress = 1,
    Success = 2,
    Failure = 3,
    Canceled = 4,
    Updated = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, FromRepr)]
#[repr(u8)]
pub enum TaskType {
    NoType = 0,
    Digit = 1,
    Timer = 2,
    ReversedTimer = 3,
    ProgressBar = 4,
    DigitSingle = 5,
}

/// Kind of roster entry, stored in the entry as `playerType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, FromRepr)]
#[repr(u8)]
pub enum PlayerType {
    Player = 1,
    Bot = 2,
    Observer = 3,
    Building = 4,
}

/// Field names of the pickled roster entries, indexed by the key id the server
/// sends instead of the name.
#[derive(Debug)]
pub struct RosterFields {
    pub players: &'static [&'static str],
    pub bots: &'static [&'static str],
    pub observers: &'static [&'static str],
    pub buildings: &'static [&'static str],
}

impl RosterFields {
    pub fn for_type(&self, player_type: PlayerType) -> &'static [&'static str] {
        match player_type {
            PlayerType::Player => self.players,
            PlayerType::Bot => self.bots,
            PlayerType::Observer => self.observers,
            PlayerType::Building => self.buildings,
        }
    }
}

pub static ROSTER_FIELDS_14_2: RosterFields = RosterFields {
    players: &[
        "accountDBID",
        "antiAbuseEnabled",
        "avatarId",
        "camouflageInfo",
        "clanColor",
        "clanID",
        "clanTag",
        "crewParams",
        "dogTag",
        "fragsCount",
        "friendlyFireEnabled",
        "id",
        "invitationsEnabled",
        "isAbuser",
        "isAlive",
        "isBot",
        "isClientLoaded",
        "isConnected",
        "isHidden",
        "isLeaver",
        "isPreBattleOwner",
        "isTShooter",
        "keyTargetMarkers",
        "killedBuildingsCount",
        "maxHealth",
        "name",
        "playerMode",
        "preBattleIdOnStart",
        "preBattleSign",
        "prebattleId",
        "realm",
        "shipComponents",
        "shipConfigDump",
        "shipId",
        "shipParamsId",
        "skinId",
        "teamId",
        "ttkStatus",
    ],
    bots: &[
        "accountDBID",
        "antiAbuseEnabled",
        "camouflageInfo",
        "clanColor",
        "clanID",
        "clanTag",
        "crewParams",
        "dogTag",
        "fragsCount",
        "friendlyFireEnabled",
        "id",
        "isAbuser",
        "isAlive",
        "isBot",
        "isHidden",
        "isTShooter",
        "killedBuildingsCount",
        "keyTargetMarkers",
        "maxHealth",
        "name",
        "realm",
        "shipComponents",
        "shipConfigDump",
        "shipId",
        "shipParamsId",
        "skinId",
        "teamId",
        "ttkStatus",
    ],
    observers: &[
        "accountDBID",
        "avatarId",
        "dogTag",
        "id",
        "invitationsEnabled",
        "isAlive",
        "isClientLoaded",
        "isConnected",
        "isLeaver",
        "isPreBattleOwner",
        "name",
        "playerMode",
        "preBattleIdOnStart",
        "preBattleSign",
        "prebattleId",
        "realm",
        "teamId",
    ],
    buildings: &[
        "id",
        "isAlive",
        "isHidden",
        "isSuppressed",
        "name",
        "paramsId",
        "teamId",
        "uniqueId",
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn death_types() {
        let ap = DeathType::from_id(17).unwrap();
        assert_eq!(ap, DeathType::ApShell);
        assert_eq!(ap.name(), "AP_SHELL");
        assert_eq!(ap.icon(), "icon_frag_main_caliber");
        assert_eq!(DeathType::from_str("SEA_MINE").unwrap().icon(), "icon_frag_naval_mine");
        assert!(DeathType::from_id(30).is_none());
        assert!(DeathType::from_id(-1).is_none());
    }

    #[test]
    fn roster_field_ids() {
        let fields = &ROSTER_FIELDS_14_2;
        assert_eq!(fields.players[2], "avatarId");
        assert_eq!(fields.players[33], "shipId");
        assert_eq!(fields.players[36], "teamId");
        assert_eq!(fields.bots[10], "id");
        assert_eq!(fields.observers[16], "teamId");
        assert_eq!(fields.for_type(PlayerType::Building)[7], "uniqueId");
    }
}
