use serde::Serialize;
use tracing::debug;

use crate::entity::Entity;
use crate::error::ErrorKind;
use crate::rpc::bit_reader::BitReader;
use crate::rpc::typedefs::ArgValue;

/// One step from a property value down to the container being patched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PropertyNestLevel {
    DictKey(String),
    ArrayIndex(usize),
}

/// The change applied to the container at the end of the path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum UpdateAction {
    SetKey { key: String, value: ArgValue },
    SetElement { index: usize, value: ArgValue },
    SetRange {
        start: usize,
        stop: usize,
        values: Vec<ArgValue>,
    },
    RemoveRange { start: usize, stop: usize },
    /// Point update without a payload.
    ClearElement { index: usize },
}

/// A decoded nested property update, already applied to the entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateCmd {
    pub property: String,
    pub levels: Vec<PropertyNestLevel>,
    pub action: UpdateAction,
}

impl UpdateCmd {
    /// Dotted path of the patched container: the property name followed by the
    /// dict keys that lead to it. Array indices are not part of the path.
    pub fn path(&self) -> String {
        let mut path = self.property.clone();
        for level in &self.levels {
            if let PropertyNestLevel::DictKey(key) = level {
                path.push('.');
                path.push_str(key);
            }
        }
        path
    }

    /// The container the action was applied to.
    pub fn leaf<'e>(&self, entity: &'e Entity) -> Option<&'e ArgValue> {
        let mut value = entity.client_property(&self.property)?;
        for level in &self.levels {
            value = match (level, value) {
                (PropertyNestLevel::DictKey(key), ArgValue::FixedDict(dict)) => dict.get(key)?,
                (PropertyNestLevel::ArrayIndex(idx), ArgValue::Array(array)) => {
                    array.items.get(*idx)?
                }
                _ => return None,
            };
        }
        Some(value)
    }
}

fn is_truthy(value: &ArgValue) -> bool {
    match value {
        ArgValue::None => false,
        ArgValue::FixedDict(dict) => !dict.is_empty(),
        ArgValue::Array(array) => !array.items.is_empty(),
        _ => true,
    }
}

fn nested_error(reason: impl Into<String>) -> ErrorKind {
    ErrorKind::NestedProperty(reason.into())
}

/// Decodes a bit-packed nested property update from `payload` and applies it to
/// `entity`. Returns `None` when the path leads somewhere we have no value for,
/// which leaves the entity untouched.
pub fn apply_nested_update(
    entity: &mut Entity,
    is_slice: bool,
    payload: &[u8],
) -> Result<Option<UpdateCmd>, ErrorKind> {
    let Some((property, levels, action)) = decode_update(entity, is_slice, payload)? else {
        return Ok(None);
    };

    let Some(mut target) = entity.client_property_mut(&property) else {
        return Ok(None);
    };
    for level in &levels {
        target = match (level, target) {
            (PropertyNestLevel::DictKey(key), ArgValue::FixedDict(dict)) => {
                match dict.get_mut(key) {
                    Some(value) => value,
                    None => return Ok(None),
                }
            }
            (PropertyNestLevel::ArrayIndex(idx), ArgValue::Array(array)) => {
                match array.items.get_mut(*idx) {
                    Some(value) => value,
                    None => return Ok(None),
                }
            }
            _ => return Ok(None),
        };
    }

    match (&action, target) {
        (UpdateAction::SetKey { key, value }, ArgValue::FixedDict(dict)) => {
            if let Some(slot) = dict.get_mut(key) {
                *slot = value.clone();
            }
        }
        (UpdateAction::SetElement { index, value }, ArgValue::Array(array)) => {
            let len = array.items.len();
            let slot = array
                .items
                .get_mut(*index)
                .ok_or_else(|| nested_error(format!("index {} out of range for {} items", index, len)))?;
            *slot = value.clone();
        }
        (UpdateAction::ClearElement { index }, ArgValue::Array(array)) => {
            let len = array.items.len();
            let slot = array
                .items
                .get_mut(*index)
                .ok_or_else(|| nested_error(format!("index {} out of range for {} items", index, len)))?;
            *slot = ArgValue::None;
        }
        (UpdateAction::SetRange { start, stop, values }, ArgValue::Array(array)) => {
            let (start, stop) = clamp_range(*start, *stop, array.items.len());
            array.items.splice(start..stop, values.iter().cloned());
        }
        (UpdateAction::RemoveRange { start, stop }, ArgValue::Array(array)) => {
            let (start, stop) = clamp_range(*start, *stop, array.items.len());
            array.items.drain(start..stop);
        }
        _ => return Ok(None),
    }

    let cmd = UpdateCmd {
        property,
        levels,
        action,
    };
    debug!("entity {} nested update {}: {:?}", entity.id(), cmd.path(), cmd.action);
    Ok(Some(cmd))
}

/// Slice bounds behave like Python's: both ends clamp to the list and an
/// inverted range is empty.
fn clamp_range(start: usize, stop: usize, len: usize) -> (usize, usize) {
    let start = start.min(len);
    (start, stop.clamp(start, len))
}

/// Reads the path against the current property values without modifying them.
fn decode_update(
    entity: &Entity,
    is_slice: bool,
    payload: &[u8],
) -> Result<Option<(String, Vec<PropertyNestLevel>, UpdateAction)>, ErrorKind> {
    let mut reader = BitReader::new(payload);
    if !reader.read_bit()? {
        return Err(nested_error("update does not address a property"));
    }

    let def = entity.def();
    let width = BitReader::bits_required(def.client_properties().len());
    let index = reader.read_bits(width)? as usize;
    let property = def.client_property(index)?.name.clone();

    let Some(mut value) = entity.client_property(&property) else {
        debug!("entity {} has no value for {} yet", entity.id(), property);
        return Ok(None);
    };

    let mut levels = Vec::new();
    while reader.read_bit()? && is_truthy(value) {
        value = match value {
            ArgValue::FixedDict(dict) => {
                let idx = reader.read_bits(BitReader::bits_required(dict.len()))? as usize;
                let (Some(name), Some(next)) = (dict.field_name(idx), dict.values.get(idx)) else {
                    return Ok(None);
                };
                levels.push(PropertyNestLevel::DictKey(name.to_owned()));
                next
            }
            ArgValue::Array(array) => {
                let idx = reader.read_bits(BitReader::bits_required(array.items.len()))? as usize;
                let Some(next) = array.items.get(idx) else {
                    return Ok(None);
                };
                levels.push(PropertyNestLevel::ArrayIndex(idx));
                next
            }
            _ => return Ok(None),
        };
    }

    let action = match value {
        ArgValue::FixedDict(dict) => {
            if is_slice {
                return Err(nested_error("slice update addressed a dict"));
            }
            let idx = reader.read_bits(BitReader::bits_required(dict.len()))? as usize;
            let Some(field) = dict.desc.fields.get(idx) else {
                return Ok(None);
            };
            let (_, value) = field.ty.parse(reader.rest(), 1)?;
            UpdateAction::SetKey {
                key: field.name.clone(),
                value,
            }
        }
        ArgValue::Array(array) => {
            let width = BitReader::bits_required(array.items.len() + is_slice as usize);
            let start = reader.read_bits(width)? as usize;
            let stop = if is_slice {
                Some(reader.read_bits(width)? as usize)
            } else {
                None
            };

            let rest = reader.rest();
            let mut values = Vec::new();
            let mut i = rest;
            while !i.is_empty() {
                let (next, item) = array.element.parse(i, 1)?;
                if next.len() == i.len() {
                    return Err(nested_error("array element consumed no input"));
                }
                values.push(item);
                i = next;
            }

            match (stop, values.is_empty()) {
                (Some(stop), true) => UpdateAction::RemoveRange { start, stop },
                (Some(stop), false) => UpdateAction::SetRange {
                    start,
                    stop,
                    values,
                },
                (None, true) => UpdateAction::ClearElement { index: start },
                (None, false) => UpdateAction::SetElement {
                    index: start,
                    value: values.swap_remove(0),
                },
            }
        }
        _ => {
            debug!("nested update on {} stopped at a scalar", property);
            return Ok(None);
        }
    };

    Ok(Some((property, levels, action)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::zone;

    /// MSB-first bit packer for building paths.
    struct Bits {
        bytes: Vec<u8>,
        used: usize,
    }

    impl Bits {
        fn new() -> Self {
            Bits {
                bytes: Vec::new(),
                used: 0,
            }
        }

        fn push(mut self, value: u64, width: u8) -> Self {
            for bit in (0..width).rev() {
                if self.used % 8 == 0 {
                    self.bytes.push(0);
                }
                if (value >> bit) & 1 == 1 {
                    let last = self.bytes.len() - 1;
                    self.bytes[last] |= 0x80 >> (self.used % 8);
                }
                self.used += 1;
            }
            self
        }

        fn with_payload(self, payload: &[u8]) -> Vec<u8> {
            let mut bytes = self.bytes;
            bytes.extend_from_slice(payload);
            bytes
        }
    }

    fn point(x: f32, y: f32) -> Vec<u8> {
        let mut data = x.to_le_bytes().to_vec();
        data.extend_from_slice(&y.to_le_bytes());
        data
    }

    /// Zone with `area = { name: "a", points: [(1,1), (2,2), (3,3)], ids: [] }`.
    fn populated_zone() -> Entity {
        let mut entity = zone();
        let mut area = vec![1, b'a', 3];
        area.extend(point(1.0, 1.0));
        area.extend(point(2.0, 2.0));
        area.extend(point(3.0, 3.0));
        area.push(0);
        entity.set_client_property(1, &area).unwrap();
        entity
    }

    fn points(entity: &Entity) -> Vec<f64> {
        entity
            .client_property("area")
            .and_then(|area| area.get("points"))
            .and_then(ArgValue::as_list)
            .unwrap()
            .iter()
            .map(|p| p.get("x").and_then(ArgValue::as_f64).unwrap())
            .collect()
    }

    // Client properties: radius(0), area(1) -> 1 bit. AREA fields: name, points, ids -> 2 bits.

    #[test]
    fn dict_field_set() {
        let mut entity = populated_zone();
        let payload = Bits::new()
            .push(1, 1) // entity level
            .push(1, 1) // area
            .push(0, 1) // stop at area
            .push(0, 2) // field `name`
            .with_payload(&[2, b'z', b'z']);

        let cmd = apply_nested_update(&mut entity, false, &payload).unwrap().unwrap();
        assert_eq!(cmd.path(), "area");
        assert_eq!(
            entity.client_property("area").unwrap().get("name"),
            Some(&ArgValue::String("zz".to_owned()))
        );
        assert!(matches!(cmd.leaf(&entity), Some(ArgValue::FixedDict(_))));
    }

    #[test]
    fn array_point_set() {
        let mut entity = populated_zone();
        let payload = Bits::new()
            .push(1, 1)
            .push(1, 1)
            .push(1, 1) // descend
            .push(1, 2) // points
            .push(0, 1) // stop at points
            .push(2, 2) // index 2 of 3
            .with_payload(&point(9.0, 9.0));

        let cmd = apply_nested_update(&mut entity, false, &payload).unwrap().unwrap();
        assert_eq!(cmd.path(), "area.points");
        assert_eq!(points(&entity), [1.0, 2.0, 9.0]);
        assert_eq!(cmd.leaf(&entity).and_then(ArgValue::container_len), Some(3));
    }

    #[test]
    fn slice_replace_and_delete() {
        let mut entity = populated_zone();
        // Slice widths address len + 1 = 4 values -> 2 bits.
        let mut replacement = point(7.0, 7.0);
        replacement.extend(point(8.0, 8.0));
        let payload = Bits::new()
            .push(1, 1)
            .push(1, 1)
            .push(1, 1)
            .push(1, 2)
            .push(0, 1)
            .push(1, 2)
            .push(2, 2)
            .with_payload(&replacement);
        apply_nested_update(&mut entity, true, &payload).unwrap().unwrap();
        assert_eq!(points(&entity), [1.0, 7.0, 8.0, 3.0]);

        // len 4 -> 5 values -> 3 bits; delete [0:2]
        let payload = Bits::new()
            .push(1, 1)
            .push(1, 1)
            .push(1, 1)
            .push(1, 2)
            .push(0, 1)
            .push(0, 3)
            .push(2, 3)
            .with_payload(&[]);
        let cmd = apply_nested_update(&mut entity, true, &payload).unwrap().unwrap();
        assert_eq!(cmd.action, UpdateAction::RemoveRange { start: 0, stop: 2 });
        assert_eq!(points(&entity), [8.0, 3.0]);
    }

    #[test]
    fn empty_point_payload_clears_element() {
        let mut entity = populated_zone();
        let payload = Bits::new()
            .push(1, 1)
            .push(1, 1)
            .push(1, 1)
            .push(1, 2)
            .push(0, 1)
            .push(0, 2)
            .with_payload(&[]);
        apply_nested_update(&mut entity, false, &payload).unwrap().unwrap();
        let list = entity
            .client_property("area")
            .and_then(|area| area.get("points"))
            .and_then(ArgValue::as_list)
            .unwrap();
        assert_eq!(list[0], ArgValue::None);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn missing_property_is_ignored() {
        let mut entity = zone();
        let payload = Bits::new().push(1, 1).push(1, 1).push(0, 1).push(0, 2).with_payload(&[]);
        assert_eq!(apply_nested_update(&mut entity, false, &payload).unwrap(), None);
    }

    #[test]
    fn slice_on_dict_is_rejected() {
        let mut entity = populated_zone();
        let payload = Bits::new().push(1, 1).push(1, 1).push(0, 1).push(0, 2).with_payload(&[]);
        let err = apply_nested_update(&mut entity, true, &payload).unwrap_err();
        assert!(matches!(err, ErrorKind::NestedProperty(_)));
    }

    #[test]
    fn out_of_range_point_set_fails() {
        let mut entity = populated_zone();
        let payload = Bits::new()
            .push(1, 1)
            .push(1, 1)
            .push(1, 1)
            .push(1, 2)
            .push(0, 1)
            .push(3, 2)
            .with_payload(&point(0.0, 0.0));
        assert!(apply_nested_update(&mut entity, false, &payload).is_err());
        assert_eq!(points(&entity), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn exhausted_path_is_a_decode_error() {
        let mut entity = populated_zone();
        let err = apply_nested_update(&mut entity, false, &[]).unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Decode);
    }
}
