use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

use crate::error::ErrorKind;

/// Per-session entity identifier. Packets carry it as either i32 or u32; the
/// roster pickles carry it as a Python int.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u32);

impl EntityId {
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for EntityId {
    fn from(v: u32) -> Self {
        EntityId(v)
    }
}

impl From<i32> for EntityId {
    fn from(v: i32) -> Self {
        EntityId(v as u32)
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId(v as u32)
    }
}

/// Seconds since the replay started recording, as carried by every packet frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameClock(pub f32);

impl GameClock {
    pub fn seconds(self) -> f32 {
        self.0
    }
}

impl fmt::Display for GameClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}s", self.0)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Vec3 { x, y, z }
    }
}

impl From<(f32, f32, f32)> for Vec3 {
    fn from((x, y, z): (f32, f32, f32)) -> Self {
        Vec3 { x, y, z }
    }
}

/// Relation of an object to the recording player. Serialized as `-1`/`0`/`1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Relation {
    /// The recording player itself.
    Owner,
    Ally,
    Enemy,
    /// Objects that belong to no team, such as uncaptured control points.
    Neutral,
}

impl Relation {
    pub fn from_flags(is_ally: bool, is_owner: bool) -> Self {
        match (is_ally, is_owner) {
            (_, true) => Relation::Owner,
            (true, false) => Relation::Ally,
            (false, false) => Relation::Enemy,
        }
    }

    /// Relation of something owned by `team_id`, where `-1` means no team.
    pub fn from_teams(team_id: i64, owner_team_id: i64) -> Self {
        if team_id == -1 {
            Relation::Neutral
        } else if team_id == owner_team_id {
            Relation::Ally
        } else {
            Relation::Enemy
        }
    }

    pub fn raw(self) -> i8 {
        match self {
            Relation::Owner | Relation::Neutral => -1,
            Relation::Ally => 0,
            Relation::Enemy => 1,
        }
    }
}

impl Serialize for Relation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i8(self.raw())
    }
}

/// Game client version as reported by `clientVersionFromXml`, e.g. `13,0,0,7851390`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32, build: u32) -> Self {
        Version {
            major,
            minor,
            patch,
            build,
        }
    }

    /// Parses the comma separated form found in the replay header. Whitespace is
    /// ignored and a missing build component is treated as zero.
    pub fn from_client_xml(version: &str) -> Result<Self, ErrorKind> {
        let cleaned: String = version.chars().filter(|c| !c.is_whitespace()).collect();
        let parts = cleaned
            .split(',')
            .map(|part| {
                part.parse::<u32>()
                    .map_err(|_| ErrorKind::UnsupportedVersion(version.to_owned()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        match parts.as_slice() {
            [major, minor, patch] => Ok(Version::new(*major, *minor, *patch, 0)),
            [major, minor, patch, build, ..] => Ok(Version::new(*major, *minor, *patch, *build)),
            _ => Err(ErrorKind::UnsupportedVersion(version.to_owned())),
        }
    }

    /// `13_0_0_7851390`
    pub fn to_schema_key(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.major, self.minor, self.patch, self.build
        )
    }

    /// `13_0_0`
    pub fn to_short_schema_key(&self) -> String {
        format!("{}_{}_{}", self.major, self.minor, self.patch)
    }

    pub fn is_at_least(&self, other: &Version) -> bool {
        self >= other
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch, self.build).cmp(&(
            other.major,
            other.minor,
            other.patch,
            other.build,
        ))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_header_form() {
        let version = Version::from_client_xml("13, 0, 0, 7851390").unwrap();
        assert_eq!(version, Version::new(13, 0, 0, 7851390));
        assert_eq!(version.to_schema_key(), "13_0_0_7851390");
        assert_eq!(version.to_short_schema_key(), "13_0_0");
    }

    #[test]
    fn version_ordering() {
        let old = Version::from_client_xml("12,5,0,100").unwrap();
        let new = Version::from_client_xml("12,6,0").unwrap();
        assert!(old < new);
        assert!(new.is_at_least(&Version::new(12, 6, 0, 0)));
    }

    #[test]
    fn version_rejects_garbage() {
        assert!(Version::from_client_xml("thirteen").is_err());
        assert!(Version::from_client_xml("13,0").is_err());
    }

    #[test]
    fn relation_serializes_as_integer() {
        let json = serde_json::to_string(&[Relation::Owner, Relation::Ally, Relation::Enemy]).unwrap();
        assert_eq!(json, "[-1,0,1]");
        assert_eq!(Relation::from_flags(true, true), Relation::Owner);
        assert_eq!(Relation::from_flags(false, false), Relation::Enemy);
    }
}
