use std::collections::BTreeMap;

use pickled::value::{HashableValue, Value};
use serde_json::{Map, Value as Json};
use tracing::trace;

use crate::error::ErrorKind;
use crate::game_constants::{PlayerType, RosterFields};

pub type RosterEntry = Map<String, Json>;

/// Everyone the arena state mentions: players, bots, observers and buildings,
/// keyed by their roster `id`.
#[derive(Debug, Default, Clone)]
pub struct PlayersInfo {
    entries: BTreeMap<i64, RosterEntry>,
}

impl PlayersInfo {
    /// Merges a pickled list of roster entries. Entries are lists of
    /// `(key id, value)` tuples; known ids are renamed through `fields`.
    pub fn create_or_update(
        &mut self,
        blob: &[u8],
        player_type: PlayerType,
        fields: &RosterFields,
    ) -> Result<(), ErrorKind> {
        let names = fields.for_type(player_type);
        let list = unpickle(blob, "roster")?;
        let Value::List(entries) = list else {
            return Err(ErrorKind::Pickle {
                what: "roster",
                reason: "expected a list of entries".to_owned(),
            });
        };

        for entry in entries.inner().iter() {
            let mut fields = RosterEntry::new();
            if let Value::List(pairs) = entry {
                for pair in pairs.inner().iter() {
                    let Value::Tuple(kv) = pair else {
                        continue;
                    };
                    let kv = kv.inner();
                    let (Some(Value::I64(key)), Some(value)) = (kv.first(), kv.get(1)) else {
                        continue;
                    };
                    match usize::try_from(*key).ok().and_then(|idx| names.get(idx)) {
                        Some(name) => {
                            fields.insert((*name).to_owned(), pickle_to_json(value));
                        }
                        None => trace!("unnamed roster key {}", key),
                    }
                }
            }

            let Some(id) = fields.get("id").and_then(Json::as_i64) else {
                trace!("roster entry without an id");
                continue;
            };
            fields.insert("playerType".to_owned(), Json::from(player_type as u8));
            self.entries.entry(id).or_default().extend(fields);
        }
        Ok(())
    }

    pub fn get(&self, id: i64) -> Option<&RosterEntry> {
        self.entries.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&i64, &RosterEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Roster entry of the player whose avatar recorded the replay.
    pub fn find_by_avatar(&self, avatar_id: i64) -> Option<&RosterEntry> {
        self.entries
            .values()
            .find(|entry| entry.get("avatarId").and_then(Json::as_i64) == Some(avatar_id))
    }

    pub fn to_map(&self) -> BTreeMap<i64, RosterEntry> {
        self.entries.clone()
    }
}

pub fn unpickle(blob: &[u8], what: &'static str) -> Result<Value, ErrorKind> {
    pickled::de::value_from_slice(blob, pickled::de::DeOptions::new()).map_err(|err| {
        ErrorKind::Pickle {
            what,
            reason: err.to_string(),
        }
    })
}

/// Python 2 style `str` payloads arrive as bytes; they are latin-1 when they
/// aren't UTF-8.
fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

pub fn pickle_to_json(value: &Value) -> Json {
    match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::I64(i) => Json::from(*i),
        Value::F64(f) => Json::from(*f),
        Value::Bytes(b) => {
            let bytes: &[u8] = &b.inner();
            Json::String(bytes_to_string(bytes))
        }
        Value::String(s) => Json::String(s.inner().clone()),
        Value::List(l) => Json::Array(l.inner().iter().map(pickle_to_json).collect()),
        Value::Tuple(t) => Json::Array(t.inner().iter().map(pickle_to_json).collect()),
        Value::Set(s) => Json::Array(s.inner().iter().map(hashable_to_json).collect()),
        Value::FrozenSet(s) => Json::Array(s.inner().iter().map(hashable_to_json).collect()),
        Value::Dict(d) => Json::Object(
            d.inner()
                .iter()
                .map(|(key, value)| (hashable_to_key(key), pickle_to_json(value)))
                .collect(),
        ),
        other => Json::String(format!("{:?}", other)),
    }
}

fn hashable_to_json(value: &HashableValue) -> Json {
    match value {
        HashableValue::None => Json::Null,
        HashableValue::Bool(b) => Json::Bool(*b),
        HashableValue::I64(i) => Json::from(*i),
        HashableValue::F64(f) => Json::from(*f),
        HashableValue::Bytes(b) => {
            let bytes: &[u8] = &b.inner();
            Json::String(bytes_to_string(bytes))
        }
        HashableValue::String(s) => Json::String(s.inner().clone()),
        HashableValue::Tuple(t) => Json::Array(t.inner().iter().map(hashable_to_json).collect()),
        other => Json::String(format!("{:?}", other)),
    }
}

/// JSON object keys must be strings.
pub fn hashable_to_key(value: &HashableValue) -> String {
    match hashable_to_json(value) {
        Json::String(s) => s,
        other => other.to_string(),
    }
}

/// Integer view of a pickled value, used for dict keys like `(type, kind)`.
pub fn hashable_i64(value: &HashableValue) -> Option<i64> {
    match value {
        HashableValue::I64(i) => Some(*i),
        HashableValue::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game_constants::ROSTER_FIELDS_14_2;

    /// Protocol 2 pickle of `[[(2, 50), (11, 7), (25, u"abcd"), (200, 1)]]`.
    const ONE_PLAYER: &[u8] = b"\x80\x02](](K\x02K2\x86K\x0bK\x07\x86K\x19X\x04\x00\x00\x00abcd\x86K\xc8K\x01\x86ee.";

    /// `[[(11, 7), (25, u"wxyz")]]`
    const RENAMED: &[u8] = b"\x80\x02](](K\x0bK\x07\x86K\x19X\x04\x00\x00\x00wxyz\x86ee.";

    #[test]
    fn entries_are_named_by_key_id() {
        let mut players = PlayersInfo::default();
        players
            .create_or_update(ONE_PLAYER, PlayerType::Player, &ROSTER_FIELDS_14_2)
            .unwrap();

        assert_eq!(players.len(), 1);
        let entry = players.get(7).unwrap();
        assert_eq!(entry["avatarId"], 50);
        assert_eq!(entry["name"], "abcd");
        assert_eq!(entry["playerType"], PlayerType::Player as u8);
        assert_eq!(entry.len(), 4);
        assert_eq!(players.find_by_avatar(50).unwrap()["id"], 7);
        assert!(players.find_by_avatar(51).is_none());
    }

    #[test]
    fn updates_merge_into_existing_entries() {
        let mut players = PlayersInfo::default();
        players
            .create_or_update(ONE_PLAYER, PlayerType::Player, &ROSTER_FIELDS_14_2)
            .unwrap();
        players
            .create_or_update(RENAMED, PlayerType::Player, &ROSTER_FIELDS_14_2)
            .unwrap();

        let entry = players.get(7).unwrap();
        assert_eq!(entry["name"], "wxyz");
        assert_eq!(entry["avatarId"], 50);
    }

    #[test]
    fn non_list_roster_is_rejected() {
        let mut players = PlayersInfo::default();
        // `None`
        let err = players
            .create_or_update(b"\x80\x02N.", PlayerType::Bot, &ROSTER_FIELDS_14_2)
            .unwrap_err();
        assert!(matches!(err, ErrorKind::Pickle { what: "roster", .. }));
        assert!(players.is_empty());
    }

    #[test]
    fn latin1_bytes() {
        assert_eq!(bytes_to_string(b"caf\xe9"), "café");
        assert_eq!(bytes_to_string("café".as_bytes()), "café");
    }
}
