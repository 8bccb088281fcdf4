use std::collections::HashMap;

use roxmltree::Node;
use tracing::trace;

use crate::error::ErrorKind;
use crate::rpc::typedefs::{ArrayType, FixedDictField, FixedDictType, TypeDesc, node_text};
use crate::Rc;

pub const ALIAS_PATH: &str = "scripts/entity_defs/alias.xml";

/// Named type aliases from `alias.xml`, fully resolved.
#[derive(Debug, Default)]
pub struct AliasTable {
    aliases: HashMap<String, Rc<TypeDesc>>,
}

impl AliasTable {
    pub fn parse(xml: &str) -> Result<Self, ErrorKind> {
        let doc = roxmltree::Document::parse(xml).map_err(|err| ErrorKind::Xml {
            path: ALIAS_PATH.to_owned(),
            err,
        })?;

        let sections: Vec<Node<'_, '_>> = doc
            .root_element()
            .children()
            .filter(|node| node.is_element())
            .collect();

        let empty = HashMap::new();
        let mut resolver = Resolver {
            known: &empty,
            pending: sections
                .iter()
                .map(|node| (node.tag_name().name(), *node))
                .collect(),
            resolved: HashMap::new(),
            stack: Vec::new(),
        };

        for section in &sections {
            resolver.resolve_alias(section.tag_name().name())?;
        }

        trace!("resolved {} type aliases", resolver.resolved.len());

        Ok(AliasTable {
            aliases: resolver.resolved,
        })
    }

    pub fn get(&self, name: &str) -> Option<Rc<TypeDesc>> {
        self.aliases.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Resolves a type section such as `<Type>ENTITY_ID</Type>` or an inline
    /// `<Type>FIXED_DICT<Properties>..</Properties></Type>`.
    pub fn resolve(&self, section: Node<'_, '_>) -> Result<Rc<TypeDesc>, ErrorKind> {
        let mut resolver = Resolver {
            known: &self.aliases,
            pending: HashMap::new(),
            resolved: HashMap::new(),
            stack: Vec::new(),
        };
        resolver.resolve_section(section)
    }
}

struct Resolver<'r, 'a, 'input> {
    known: &'r HashMap<String, Rc<TypeDesc>>,
    pending: HashMap<&'a str, Node<'a, 'input>>,
    resolved: HashMap<String, Rc<TypeDesc>>,
    stack: Vec<String>,
}

impl<'a, 'input> Resolver<'_, 'a, 'input> {
    fn lookup(&self, name: &str) -> Option<Rc<TypeDesc>> {
        self.resolved
            .get(name)
            .or_else(|| self.known.get(name))
            .cloned()
    }

    fn resolve_alias(&mut self, name: &str) -> Result<Option<Rc<TypeDesc>>, ErrorKind> {
        if let Some(ty) = self.lookup(name) {
            return Ok(Some(ty));
        }
        let Some(node) = self.pending.get(name).copied() else {
            return Ok(None);
        };
        if self.stack.iter().any(|entry| entry == name) {
            return Err(ErrorKind::RecursiveAlias(name.to_owned()));
        }

        self.stack.push(name.to_owned());
        let ty = self.resolve_section(node);
        self.stack.pop();

        let ty = ty?;
        self.resolved.insert(name.to_owned(), ty.clone());
        Ok(Some(ty))
    }

    fn resolve_section(&mut self, section: Node<'a, 'input>) -> Result<Rc<TypeDesc>, ErrorKind> {
        let text = node_text(section);
        let type_name = text.trim();

        if let Some(ty) = self.resolve_alias(type_name)? {
            return Ok(ty);
        }

        let ty = match type_name {
            "BLOB" => TypeDesc::Blob,
            "STRING" | "UNICODE_STRING" => TypeDesc::String,
            "FLOAT" | "FLOAT32" => TypeDesc::Float32,
            "FLOAT64" => TypeDesc::Float64,
            "INT8" => TypeDesc::Int8,
            "INT16" => TypeDesc::Int16,
            "INT32" => TypeDesc::Int32,
            "INT64" => TypeDesc::Int64,
            "UINT8" => TypeDesc::Uint8,
            "UINT16" => TypeDesc::Uint16,
            "UINT32" => TypeDesc::Uint32,
            "UINT64" => TypeDesc::Uint64,
            "VECTOR2" => TypeDesc::Vector2,
            "VECTOR3" => TypeDesc::Vector3,
            "VECTOR4" => TypeDesc::Vector4,
            "MAILBOX" => TypeDesc::Mailbox,
            "PYTHON" => TypeDesc::Python,
            "FIXED_DICT" => {
                let mut fields = Vec::new();
                if let Some(props) = child(section, "Properties") {
                    for prop in props.children().filter(|node| node.is_element()) {
                        let type_section = child(prop, "Type").ok_or_else(|| {
                            malformed(format!("field {} has no <Type>", prop.tag_name().name()))
                        })?;
                        fields.push(FixedDictField {
                            name: prop.tag_name().name().to_owned(),
                            ty: self.resolve_section(type_section)?,
                        });
                    }
                }
                TypeDesc::FixedDict(Rc::new(FixedDictType {
                    fields,
                    allow_none: allow_none(section),
                }))
            }
            "ARRAY" | "TUPLE" => {
                let of = child(section, "of")
                    .ok_or_else(|| malformed(format!("{} has no <of>", type_name)))?;
                let element = self.resolve_section(of)?;
                let size = match child(section, "size") {
                    Some(size) => Some(
                        node_text(size)
                            .trim()
                            .parse::<usize>()
                            .map_err(|_| malformed("invalid array <size>".to_owned()))?,
                    ),
                    None => None,
                };
                TypeDesc::Array(Rc::new(ArrayType {
                    element,
                    size,
                    allow_none: allow_none(section),
                }))
            }
            "USER_TYPE" => {
                let inner = match child(section, "Type") {
                    Some(inner) => self.resolve_section(inner)?,
                    None => Rc::new(TypeDesc::Blob),
                };
                TypeDesc::UserType(inner)
            }
            other => return Err(ErrorKind::UnknownAlias(other.to_owned())),
        };

        Ok(Rc::new(ty))
    }
}

pub(crate) fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|child| child.has_tag_name(name))
}

fn allow_none(section: Node<'_, '_>) -> bool {
    child(section, "AllowNone")
        .map(|node| node_text(node).trim() == "true")
        .unwrap_or(false)
}

fn malformed(reason: String) -> ErrorKind {
    ErrorKind::MalformedDefinition {
        path: ALIAS_PATH.to_owned(),
        reason,
    }
}
