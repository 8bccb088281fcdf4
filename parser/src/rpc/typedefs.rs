use nom::{
    bytes::complete::take,
    multi::count,
    number::complete::{
        le_f32, le_f64, le_i16, le_i32, le_i64, le_i8, le_u16, le_u32, le_u64, le_u8,
    },
    sequence::tuple,
};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use variantly::Variantly;

use crate::{IResult, Rc};

/// Encoded size reported by every variable length type.
pub const INFINITY: u32 = 0xFFFF;

#[derive(Debug, Clone, PartialEq)]
pub struct FixedDictField {
    pub name: String,
    pub ty: Rc<TypeDesc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixedDictType {
    pub fields: Vec<FixedDictField>,
    pub allow_none: bool,
}

impl FixedDictType {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    pub element: Rc<TypeDesc>,
    pub size: Option<usize>,
    pub allow_none: bool,
}

/// A resolved schema type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDesc {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Vector2,
    Vector3,
    Vector4,
    String,
    Blob,
    Python,
    Mailbox,
    FixedDict(Rc<FixedDictType>),
    Array(Rc<ArrayType>),
    UserType(Rc<TypeDesc>),
}

impl TypeDesc {
    /// Encoded size in bytes, or [`INFINITY`] (possibly accumulated) for variable
    /// length data.
    pub fn size(&self) -> u32 {
        match self {
            TypeDesc::Int8 | TypeDesc::Uint8 => 1,
            TypeDesc::Int16 | TypeDesc::Uint16 => 2,
            TypeDesc::Int32 | TypeDesc::Uint32 | TypeDesc::Float32 => 4,
            TypeDesc::Int64 | TypeDesc::Uint64 | TypeDesc::Float64 => 8,
            TypeDesc::Vector2 => 8,
            TypeDesc::Vector3 => 12,
            TypeDesc::Vector4 => 16,
            TypeDesc::String
            | TypeDesc::Blob
            | TypeDesc::Python
            | TypeDesc::Mailbox
            | TypeDesc::UserType(_) => INFINITY,
            TypeDesc::FixedDict(dict) => {
                if dict.allow_none {
                    INFINITY
                } else {
                    dict.fields
                        .iter()
                        .fold(0u32, |acc, field| acc.saturating_add(field.ty.size()))
                }
            }
            TypeDesc::Array(array) => match array.size {
                Some(len) => array.element.size().saturating_mul(len as u32),
                None => INFINITY,
            },
        }
    }

    pub fn parse<'a>(&self, i: &'a [u8], header_size: usize) -> IResult<&'a [u8], ArgValue> {
        match self {
            TypeDesc::Int8 => le_i8(i).map(|(i, v)| (i, ArgValue::Int8(v))),
            TypeDesc::Int16 => le_i16(i).map(|(i, v)| (i, ArgValue::Int16(v))),
            TypeDesc::Int32 => le_i32(i).map(|(i, v)| (i, ArgValue::Int32(v))),
            TypeDesc::Int64 => le_i64(i).map(|(i, v)| (i, ArgValue::Int64(v))),
            TypeDesc::Uint8 => le_u8(i).map(|(i, v)| (i, ArgValue::Uint8(v))),
            TypeDesc::Uint16 => le_u16(i).map(|(i, v)| (i, ArgValue::Uint16(v))),
            TypeDesc::Uint32 => le_u32(i).map(|(i, v)| (i, ArgValue::Uint32(v))),
            TypeDesc::Uint64 => le_u64(i).map(|(i, v)| (i, ArgValue::Uint64(v))),
            TypeDesc::Float32 => le_f32(i).map(|(i, v)| (i, ArgValue::Float32(v))),
            TypeDesc::Float64 => le_f64(i).map(|(i, v)| (i, ArgValue::Float64(v))),
            TypeDesc::Vector2 => {
                tuple((le_f32, le_f32))(i).map(|(i, v)| (i, ArgValue::Vector2(v)))
            }
            TypeDesc::Vector3 => {
                tuple((le_f32, le_f32, le_f32))(i).map(|(i, v)| (i, ArgValue::Vector3(v)))
            }
            TypeDesc::Vector4 => tuple((le_f32, le_f32, le_f32, le_f32))(i)
                .map(|(i, v)| (i, ArgValue::Vector4(v))),
            TypeDesc::String => {
                let (i, bytes) = parse_sized_bytes(i)?;
                let value = match std::str::from_utf8(bytes) {
                    Ok(s) => ArgValue::String(s.to_owned()),
                    // Pickled payloads are declared as STRING in some schemas
                    Err(_) => ArgValue::Blob(bytes.to_vec()),
                };
                Ok((i, value))
            }
            TypeDesc::Blob => {
                let (i, bytes) = parse_sized_bytes(i)?;
                Ok((i, ArgValue::Blob(bytes.to_vec())))
            }
            TypeDesc::Python => {
                let (i, size) = le_u8(i)?;
                let (i, bytes) = take(size)(i)?;
                Ok((i, ArgValue::Python(bytes.to_vec())))
            }
            TypeDesc::Mailbox => Ok((i, ArgValue::Mailbox)),
            TypeDesc::FixedDict(dict) => {
                let i = if dict.allow_none {
                    match i.first() {
                        Some(0) => return Ok((&i[1..], ArgValue::None)),
                        Some(1) => &i[1..],
                        _ => i,
                    }
                } else {
                    i
                };

                let mut i = i;
                let mut values = Vec::with_capacity(dict.fields.len());
                for field in &dict.fields {
                    let (rest, value) = field.ty.parse(i, header_size)?;
                    values.push(value);
                    i = rest;
                }

                Ok((
                    i,
                    ArgValue::FixedDict(FixedDictValue {
                        desc: dict.clone(),
                        values,
                    }),
                ))
            }
            TypeDesc::Array(array) => {
                let (i, len) = match array.size {
                    Some(len) => (i, len),
                    None => {
                        let (i, len) = le_u8(i)?;
                        (i, len as usize)
                    }
                };
                let (i, items) = count(|i| array.element.parse(i, header_size), len)(i)?;
                Ok((
                    i,
                    ArgValue::Array(ArrayValue {
                        element: array.element.clone(),
                        items,
                    }),
                ))
            }
            TypeDesc::UserType(inner) => {
                let i = if **inner != TypeDesc::Blob {
                    take(header_size)(i)?.0
                } else {
                    i
                };
                inner.parse(i, header_size)
            }
        }
    }

    /// Value of a `<Default>` section, or the zero value of the type when the
    /// section is absent.
    pub fn default_value(&self, section: Option<roxmltree::Node<'_, '_>>) -> Result<ArgValue, String> {
        let Some(section) = section else {
            return Ok(self.zero_value());
        };
        let text = node_text(section);
        let text = text.trim();

        fn num<T: std::str::FromStr>(text: &str) -> Result<T, String> {
            text.parse::<T>()
                .map_err(|_| format!("invalid numeric default `{}`", text))
        }

        let value = match self {
            TypeDesc::Int8 => ArgValue::Int8(num(text)?),
            TypeDesc::Int16 => ArgValue::Int16(num(text)?),
            TypeDesc::Int32 => ArgValue::Int32(num(text)?),
            TypeDesc::Int64 => ArgValue::Int64(num(text)?),
            TypeDesc::Uint8 => match text.to_ascii_lowercase().as_str() {
                "true" => ArgValue::Bool(true),
                "false" => ArgValue::Bool(false),
                _ => ArgValue::Uint8(num(text)?),
            },
            TypeDesc::Uint16 => ArgValue::Uint16(num(text)?),
            TypeDesc::Uint32 => ArgValue::Uint32(num(text)?),
            TypeDesc::Uint64 => ArgValue::Uint64(num(text)?),
            TypeDesc::Float32 => ArgValue::Float32(num(text)?),
            TypeDesc::Float64 => ArgValue::Float64(num(text)?),
            TypeDesc::String => ArgValue::String(text.to_owned()),
            TypeDesc::Vector2 | TypeDesc::Vector3 | TypeDesc::Vector4 => {
                let floats = text
                    .split_whitespace()
                    .map(num::<f32>)
                    .collect::<Result<Vec<_>, _>>()?;
                match (self, floats.as_slice()) {
                    (TypeDesc::Vector2, [x, y]) => ArgValue::Vector2((*x, *y)),
                    (TypeDesc::Vector3, [x, y, z]) => ArgValue::Vector3((*x, *y, *z)),
                    (TypeDesc::Vector4, [x, y, z, w]) => ArgValue::Vector4((*x, *y, *z, *w)),
                    _ => return Err(format!("invalid vector default `{}`", text)),
                }
            }
            TypeDesc::Array(array) => {
                let items = section
                    .children()
                    .filter(|child| child.has_tag_name("item"))
                    .map(|item| array.element.default_value(Some(item)))
                    .collect::<Result<Vec<_>, _>>()?;
                ArgValue::Array(ArrayValue {
                    element: array.element.clone(),
                    items,
                })
            }
            TypeDesc::Blob
            | TypeDesc::Python
            | TypeDesc::Mailbox
            | TypeDesc::FixedDict(_)
            | TypeDesc::UserType(_) => ArgValue::None,
        };

        Ok(value)
    }

    fn zero_value(&self) -> ArgValue {
        match self {
            TypeDesc::Int8 => ArgValue::Int8(0),
            TypeDesc::Int16 => ArgValue::Int16(0),
            TypeDesc::Int32 => ArgValue::Int32(0),
            TypeDesc::Int64 => ArgValue::Int64(0),
            TypeDesc::Uint8 => ArgValue::Uint8(0),
            TypeDesc::Uint16 => ArgValue::Uint16(0),
            TypeDesc::Uint32 => ArgValue::Uint32(0),
            TypeDesc::Uint64 => ArgValue::Uint64(0),
            TypeDesc::Float32 => ArgValue::Float32(0.0),
            TypeDesc::Float64 => ArgValue::Float64(0.0),
            TypeDesc::Vector2 => ArgValue::Vector2((0.0, 0.0)),
            TypeDesc::Vector3 => ArgValue::Vector3((0.0, 0.0, 0.0)),
            TypeDesc::Vector4 => ArgValue::Vector4((0.0, 0.0, 0.0, 0.0)),
            TypeDesc::String => ArgValue::String(String::new()),
            _ => ArgValue::None,
        }
    }
}

/// Concatenated direct text children of an element, skipping comments.
pub(crate) fn node_text(node: roxmltree::Node<'_, '_>) -> String {
    node.children()
        .filter(|child| child.is_text())
        .filter_map(|child| child.text())
        .collect()
}

/// BLOB/STRING length prefix. `0xff` escapes to a u16 length followed by a padding byte.
fn parse_sized_bytes(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, size) = le_u8(i)?;
    if size == 0xff {
        let (i, size) = le_u16(i)?;
        let (i, _) = le_u8(i)?;
        take(size)(i)
    } else {
        take(size)(i)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixedDictValue {
    pub desc: Rc<FixedDictType>,
    pub values: Vec<ArgValue>,
}

impl FixedDictValue {
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.desc.field_index(name).and_then(|idx| self.values.get(idx))
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArgValue> {
        let idx = self.desc.field_index(name)?;
        self.values.get_mut(idx)
    }

    pub fn field_name(&self, index: usize) -> Option<&str> {
        self.desc.fields.get(index).map(|field| field.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.desc.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desc.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.desc
            .fields
            .iter()
            .map(|field| field.name.as_str())
            .zip(self.values.iter())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    pub element: Rc<TypeDesc>,
    pub items: Vec<ArgValue>,
}

/// A decoded property value or method argument.
#[derive(Debug, Clone, PartialEq, Variantly)]
pub enum ArgValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Uint8(u8),
    Uint16(u16),
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    Vector2((f32, f32)),
    Vector3((f32, f32, f32)),
    Vector4((f32, f32, f32, f32)),
    String(String),
    Blob(Vec<u8>),
    Python(Vec<u8>),
    FixedDict(FixedDictValue),
    Array(ArrayValue),
    Mailbox,
    None,
}

impl ArgValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ArgValue::Int8(v) => Some(*v as i64),
            ArgValue::Int16(v) => Some(*v as i64),
            ArgValue::Int32(v) => Some(*v as i64),
            ArgValue::Int64(v) => Some(*v),
            ArgValue::Uint8(v) => Some(*v as i64),
            ArgValue::Uint16(v) => Some(*v as i64),
            ArgValue::Uint32(v) => Some(*v as i64),
            ArgValue::Uint64(v) => Some(*v as i64),
            ArgValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ArgValue::Float32(v) => Some(*v as f64),
            ArgValue::Float64(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_i64().map(|v| v != 0)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Raw bytes of blob-like values. Strings yield their UTF-8 encoding.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ArgValue::Blob(b) | ArgValue::Python(b) => Some(b.as_slice()),
            ArgValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_vector3(&self) -> Option<(f32, f32, f32)> {
        match self {
            ArgValue::Vector3(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ArgValue]> {
        match self {
            ArgValue::Array(array) => Some(array.items.as_slice()),
            _ => None,
        }
    }

    /// Field lookup on a fixed dict.
    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        match self {
            ArgValue::FixedDict(dict) => dict.get(name),
            _ => None,
        }
    }

    /// Number of addressable children for nested property paths.
    pub fn container_len(&self) -> Option<usize> {
        match self {
            ArgValue::FixedDict(dict) => Some(dict.len()),
            ArgValue::Array(array) => Some(array.items.len()),
            _ => None,
        }
    }
}

impl Serialize for ArgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ArgValue::Int8(v) => serializer.serialize_i8(*v),
            ArgValue::Int16(v) => serializer.serialize_i16(*v),
            ArgValue::Int32(v) => serializer.serialize_i32(*v),
            ArgValue::Int64(v) => serializer.serialize_i64(*v),
            ArgValue::Uint8(v) => serializer.serialize_u8(*v),
            ArgValue::Uint16(v) => serializer.serialize_u16(*v),
            ArgValue::Uint32(v) => serializer.serialize_u32(*v),
            ArgValue::Uint64(v) => serializer.serialize_u64(*v),
            ArgValue::Float32(v) => serializer.serialize_f32(*v),
            ArgValue::Float64(v) => serializer.serialize_f64(*v),
            ArgValue::Bool(v) => serializer.serialize_bool(*v),
            ArgValue::Vector2(v) => v.serialize(serializer),
            ArgValue::Vector3(v) => v.serialize(serializer),
            ArgValue::Vector4(v) => v.serialize(serializer),
            ArgValue::String(v) => serializer.serialize_str(v),
            ArgValue::Blob(v) | ArgValue::Python(v) => v.serialize(serializer),
            ArgValue::FixedDict(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (name, value) in dict.iter() {
                    map.serialize_entry(name, value)?;
                }
                map.end()
            }
            ArgValue::Array(array) => {
                let mut seq = serializer.serialize_seq(Some(array.items.len()))?;
                for item in &array.items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            ArgValue::Mailbox | ArgValue::None => serializer.serialize_none(),
        }
    }
}
