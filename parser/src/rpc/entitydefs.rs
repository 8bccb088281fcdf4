use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use roxmltree::Node;
use strum_macros::{Display, EnumString};
use tracing::debug;

use crate::error::ErrorKind;
use crate::rpc::alias::{ALIAS_PATH, AliasTable, child};
use crate::rpc::typedefs::{ArgValue, INFINITY, TypeDesc, node_text};
use crate::{IResult, Rc};

pub const ENTITIES_PATH: &str = "scripts/entities.xml";
pub const ENTITY_DEFS_PATH: &str = "scripts/entity_defs";

/// Source of schema files, addressed by `/` separated paths.
pub trait DataFileLoader {
    fn get(&self, path: &str) -> Result<Cow<'_, [u8]>, ErrorKind>;
}

/// Loads schema files from a directory on disk.
pub struct DirectoryLoader {
    root: PathBuf,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryLoader { root: root.into() }
    }
}

impl DataFileLoader for DirectoryLoader {
    fn get(&self, path: &str) -> Result<Cow<'_, [u8]>, ErrorKind> {
        match std::fs::read(self.root.join(path)) {
            Ok(data) => Ok(Cow::Owned(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ErrorKind::MissingDefinitionFile(path.to_owned()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Loads schema files through a callback, e.g. from an in-memory archive.
pub struct DataFileWithCallback<F> {
    callback: F,
}

impl<F> DataFileWithCallback<F>
where
    F: Fn(&str) -> Result<Cow<'static, [u8]>, ErrorKind>,
{
    pub fn new(callback: F) -> Self {
        DataFileWithCallback { callback }
    }
}

impl<F> DataFileLoader for DataFileWithCallback<F>
where
    F: Fn(&str) -> Result<Cow<'static, [u8]>, ErrorKind>,
{
    fn get(&self, path: &str) -> Result<Cow<'_, [u8]>, ErrorKind> {
        (self.callback)(path)
    }
}

/// Visibility flags of an entity property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityFlag {
    CellPrivate = 0,
    CellPublic = 1,
    OtherClients = 2,
    OwnClient = 4,
    Base = 8,
    BaseAndClient = 16,
    CellPublicAndOwn = 32,
    AllClients = 64,
    EditorOnly = 128,
}

impl EntityFlag {
    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn matches(self, mask: u32) -> bool {
        self.bits() & mask != 0
    }
}

const CLIENT_MASK: u32 = EntityFlag::AllClients as u32
    | EntityFlag::BaseAndClient as u32
    | EntityFlag::OtherClients as u32
    | EntityFlag::OwnClient as u32
    | EntityFlag::CellPublicAndOwn as u32;
const CLIENT_INTERNAL_MASK: u32 = CLIENT_MASK & !(EntityFlag::BaseAndClient as u32);
const CELL_MASK: u32 = EntityFlag::CellPublicAndOwn as u32 | EntityFlag::CellPublic as u32;
const BASE_MASK: u32 = EntityFlag::BaseAndClient as u32;

#[derive(Debug)]
pub struct PropertyDef {
    pub name: String,
    pub ty: Rc<TypeDesc>,
    pub flags: EntityFlag,
    pub default: ArgValue,
}

impl PropertyDef {
    pub fn size(&self) -> u32 {
        self.ty.size().min(INFINITY)
    }

    pub fn parse<'a>(&self, i: &'a [u8]) -> IResult<&'a [u8], ArgValue> {
        self.ty.parse(i, 1)
    }
}

#[derive(Debug)]
pub struct MethodArg {
    /// `None` for positional `<Arg>` declarations.
    pub name: Option<String>,
    pub ty: Rc<TypeDesc>,
}

#[derive(Debug)]
pub struct MethodDef {
    pub name: String,
    pub args: Vec<MethodArg>,
    pub header_size: usize,
}

impl MethodDef {
    pub fn size(&self) -> u32 {
        let args: u32 = self
            .args
            .iter()
            .fold(0u32, |acc, arg| acc.saturating_add(arg.ty.size()));
        if args >= INFINITY {
            INFINITY + self.header_size as u32
        } else {
            args + self.header_size as u32
        }
    }

    pub fn parse_args<'a>(&self, i: &'a [u8]) -> IResult<&'a [u8], Vec<ArgValue>> {
        let mut i = i;
        let mut values = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            let (rest, value) = arg.ty.parse(i, self.header_size)?;
            values.push(value);
            i = rest;
        }
        Ok((i, values))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Volatiles {
    pub position: bool,
    pub yaw: bool,
    pub pitch: bool,
    pub roll: bool,
}

#[derive(Debug)]
pub struct EntityDef {
    name: String,
    properties: Vec<Rc<PropertyDef>>,
    volatiles: Volatiles,

    client_properties: Vec<Rc<PropertyDef>>,
    client_properties_internal: Vec<Rc<PropertyDef>>,
    cell_properties: Vec<Rc<PropertyDef>>,
    base_properties: Vec<Rc<PropertyDef>>,

    client_methods: Vec<Rc<MethodDef>>,
    cell_methods: Vec<Rc<MethodDef>>,
    base_methods: Vec<Rc<MethodDef>>,
}

impl EntityDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All properties in declaration order, after interface overrides.
    pub fn properties(&self) -> &[Rc<PropertyDef>] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Rc<PropertyDef>> {
        self.properties.iter().find(|prop| prop.name == name)
    }

    pub fn volatiles(&self) -> Volatiles {
        self.volatiles
    }

    /// Client visible properties in wire-index order.
    pub fn client_properties(&self) -> &[Rc<PropertyDef>] {
        &self.client_properties
    }

    pub fn client_properties_internal(&self) -> &[Rc<PropertyDef>] {
        &self.client_properties_internal
    }

    pub fn cell_properties(&self) -> &[Rc<PropertyDef>] {
        &self.cell_properties
    }

    pub fn base_properties(&self) -> &[Rc<PropertyDef>] {
        &self.base_properties
    }

    /// Client methods in wire-index order.
    pub fn client_methods(&self) -> &[Rc<MethodDef>] {
        &self.client_methods
    }

    pub fn cell_methods(&self) -> &[Rc<MethodDef>] {
        &self.cell_methods
    }

    pub fn base_methods(&self) -> &[Rc<MethodDef>] {
        &self.base_methods
    }

    pub fn client_property(&self, index: usize) -> Result<&Rc<PropertyDef>, ErrorKind> {
        self.indexed(&self.client_properties, "client", index)
    }

    pub fn client_property_internal(&self, index: usize) -> Result<&Rc<PropertyDef>, ErrorKind> {
        self.indexed(&self.client_properties_internal, "internal client", index)
    }

    pub fn cell_property(&self, index: usize) -> Result<&Rc<PropertyDef>, ErrorKind> {
        self.indexed(&self.cell_properties, "cell", index)
    }

    pub fn base_property(&self, index: usize) -> Result<&Rc<PropertyDef>, ErrorKind> {
        self.indexed(&self.base_properties, "base", index)
    }

    pub fn client_method(&self, index: usize) -> Result<&Rc<MethodDef>, ErrorKind> {
        self.client_methods
            .get(index)
            .ok_or_else(|| ErrorKind::MethodIndex {
                entity: self.name.clone(),
                index,
            })
    }

    fn indexed<'s>(
        &self,
        props: &'s [Rc<PropertyDef>],
        scope: &'static str,
        index: usize,
    ) -> Result<&'s Rc<PropertyDef>, ErrorKind> {
        props.get(index).ok_or_else(|| ErrorKind::PropertyIndex {
            entity: self.name.clone(),
            scope,
            index,
        })
    }
}

/// Every entity type declared for one game version.
#[derive(Debug)]
pub struct Definitions {
    aliases: AliasTable,
    by_index: Vec<Rc<EntityDef>>,
    by_name: HashMap<String, Rc<EntityDef>>,
}

impl Definitions {
    /// Loads `alias.xml`, `entities.xml` and every referenced `.def` file found
    /// under `root`.
    pub fn load<L: DataFileLoader + ?Sized>(loader: &L, root: &str) -> Result<Self, ErrorKind> {
        let files = SchemaFiles { loader, root };

        let aliases = AliasTable::parse(&files.read(ALIAS_PATH)?)?;

        let entities_xml = files.read(ENTITIES_PATH)?;
        let entities = parse_document(ENTITIES_PATH, &entities_xml)?;
        let client_server = child(entities.root_element(), "ClientServerEntities").ok_or_else(|| {
            ErrorKind::MalformedDefinition {
                path: ENTITIES_PATH.to_owned(),
                reason: "missing <ClientServerEntities>".to_owned(),
            }
        })?;

        let mut by_index = Vec::new();
        let mut by_name = HashMap::new();
        for entity in client_server.children().filter(|node| node.is_element()) {
            let name = entity.tag_name().name();
            let def = Rc::new(EntityDefParser::new(&files, &aliases).parse(name)?);
            debug!(
                "loaded entity {} with {} properties and {} client methods",
                name,
                def.properties.len(),
                def.client_methods.len()
            );
            by_name.insert(name.to_owned(), def.clone());
            by_index.push(def);
        }

        Ok(Definitions {
            aliases,
            by_index,
            by_name,
        })
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn resolve_by_name(&self, name: &str) -> Result<Rc<EntityDef>, ErrorKind> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| ErrorKind::UnknownEntityType(name.to_owned()))
    }

    /// Entity type indices on the wire start at 1.
    pub fn resolve_by_index(&self, index: u32) -> Result<Rc<EntityDef>, ErrorKind> {
        index
            .checked_sub(1)
            .and_then(|idx| self.by_index.get(idx as usize))
            .cloned()
            .ok_or(ErrorKind::EntityTypeIndex {
                index,
                count: self.by_index.len(),
            })
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &Rc<EntityDef>> {
        self.by_index.iter()
    }
}

struct SchemaFiles<'l, L: ?Sized> {
    loader: &'l L,
    root: &'l str,
}

impl<L: DataFileLoader + ?Sized> SchemaFiles<'_, L> {
    fn read(&self, path: &str) -> Result<String, ErrorKind> {
        let full_path = if self.root.is_empty() {
            path.to_owned()
        } else {
            format!("{}/{}", self.root.trim_end_matches('/'), path)
        };
        let data = self.loader.get(&full_path)?;
        String::from_utf8(data.into_owned()).map_err(|_| ErrorKind::MalformedDefinition {
            path: full_path,
            reason: "file is not valid UTF-8".to_owned(),
        })
    }
}

fn parse_document<'input>(path: &str, xml: &'input str) -> Result<roxmltree::Document<'input>, ErrorKind> {
    roxmltree::Document::parse(xml).map_err(|err| ErrorKind::Xml {
        path: path.to_owned(),
        err,
    })
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|node| node.is_element())
}

struct EntityDefParser<'f, 'l, L: ?Sized> {
    files: &'f SchemaFiles<'l, L>,
    aliases: &'f AliasTable,
    path: String,
    interfaces: Vec<String>,
    properties: Vec<Rc<PropertyDef>>,
    volatiles: Volatiles,
    client_methods: Vec<Rc<MethodDef>>,
    cell_methods: Vec<Rc<MethodDef>>,
    base_methods: Vec<Rc<MethodDef>>,
}

impl<'f, 'l, L: DataFileLoader + ?Sized> EntityDefParser<'f, 'l, L> {
    fn new(files: &'f SchemaFiles<'l, L>, aliases: &'f AliasTable) -> Self {
        EntityDefParser {
            files,
            aliases,
            path: String::new(),
            interfaces: Vec::new(),
            properties: Vec::new(),
            volatiles: Volatiles::default(),
            client_methods: Vec::new(),
            cell_methods: Vec::new(),
            base_methods: Vec::new(),
        }
    }

    fn parse(mut self, name: &str) -> Result<EntityDef, ErrorKind> {
        let path = format!("{}/{}.def", ENTITY_DEFS_PATH, name);
        self.parse_file(&path)?;

        let select = |mask: u32| -> Vec<Rc<PropertyDef>> {
            self.properties
                .iter()
                .filter(|prop| prop.flags.matches(mask))
                .cloned()
                .collect()
        };

        let mut client_properties = select(CLIENT_MASK);
        // Wire indices are assigned by payload size, declaration order breaking ties
        client_properties.sort_by_key(|prop| prop.size());
        let client_properties_internal = select(CLIENT_INTERNAL_MASK);
        let cell_properties = select(CELL_MASK);
        let base_properties = select(BASE_MASK);

        Ok(EntityDef {
            name: name.to_owned(),
            client_properties,
            client_properties_internal,
            cell_properties,
            base_properties,
            properties: self.properties,
            volatiles: self.volatiles,
            client_methods: exposed_order(self.client_methods),
            cell_methods: exposed_order(self.cell_methods),
            base_methods: exposed_order(self.base_methods),
        })
    }

    fn parse_file(&mut self, path: &str) -> Result<(), ErrorKind> {
        let xml = self.files.read(path)?;
        let doc = parse_document(path, &xml)?;
        let previous = std::mem::replace(&mut self.path, path.to_owned());
        let result = self.parse_section(doc.root_element());
        self.path = previous;
        result
    }

    fn parse_section(&mut self, section: Node<'_, '_>) -> Result<(), ErrorKind> {
        if let Some(implements) = child(section, "Implements") {
            for interface in elements(implements) {
                let name = node_text(interface).trim().to_owned();
                if self.interfaces.contains(&name) {
                    return Err(self.malformed(format!("interface {} includes itself", name)));
                }
                self.interfaces.push(name.clone());
                let path = format!("{}/interfaces/{}.def", ENTITY_DEFS_PATH, name);
                let result = self.parse_file(&path);
                self.interfaces.pop();
                result?;
            }
        }

        if let Some(properties) = child(section, "Properties") {
            for prop in elements(properties) {
                let prop = Rc::new(self.parse_property(prop)?);
                // A redeclaration moves the property to the end
                self.properties.retain(|existing| existing.name != prop.name);
                self.properties.push(prop);
            }
        }

        if let Some(volatile) = child(section, "Volatile") {
            for item in elements(volatile) {
                match item.tag_name().name() {
                    "position" => self.volatiles.position = true,
                    "yaw" => self.volatiles.yaw = true,
                    "pitch" => self.volatiles.pitch = true,
                    "roll" => self.volatiles.roll = true,
                    _ => {}
                }
            }
        }

        for (tag, scope) in [
            ("ClientMethods", MethodScope::Client),
            ("CellMethods", MethodScope::Cell),
            ("BaseMethods", MethodScope::Base),
        ] {
            let Some(methods) = child(section, tag) else {
                continue;
            };
            for method in elements(methods) {
                let method = self.parse_method(method)?;
                let set = match scope {
                    MethodScope::Client => &mut self.client_methods,
                    MethodScope::Cell => &mut self.cell_methods,
                    MethodScope::Base => &mut self.base_methods,
                };
                // First declaration wins
                if set.iter().all(|existing| existing.name != method.name) {
                    set.push(Rc::new(method));
                }
            }
        }

        Ok(())
    }

    fn parse_property(&self, section: Node<'_, '_>) -> Result<PropertyDef, ErrorKind> {
        let name = section.tag_name().name();
        let type_section = child(section, "Type")
            .ok_or_else(|| self.malformed(format!("property {} has no <Type>", name)))?;
        let ty = self.resolve_type(type_section)?;

        let flags_text = child(section, "Flags")
            .map(node_text)
            .ok_or_else(|| self.malformed(format!("property {} has no <Flags>", name)))?;
        let flags = EntityFlag::from_str(flags_text.trim())
            .map_err(|_| self.malformed(format!("property {} has unknown flags {}", name, flags_text.trim())))?;

        let default = ty
            .default_value(child(section, "Default"))
            .map_err(|reason| self.malformed(format!("property {}: {}", name, reason)))?;

        Ok(PropertyDef {
            name: name.to_owned(),
            ty,
            flags,
            default,
        })
    }

    fn parse_method(&self, section: Node<'_, '_>) -> Result<MethodDef, ErrorKind> {
        let mut args = Vec::new();
        if let Some(named) = child(section, "Args") {
            for arg in elements(named) {
                args.push(MethodArg {
                    name: Some(arg.tag_name().name().to_owned()),
                    ty: self.resolve_type(arg)?,
                });
            }
        } else {
            for arg in elements(section).filter(|node| node.has_tag_name("Arg")) {
                args.push(MethodArg {
                    name: None,
                    ty: self.resolve_type(arg)?,
                });
            }
        }

        let header_size = child(section, "VariableLengthHeaderSize")
            .and_then(|node| node_text(node).trim().parse::<usize>().ok())
            .unwrap_or(1);

        Ok(MethodDef {
            name: section.tag_name().name().to_owned(),
            args,
            header_size,
        })
    }

    fn resolve_type(&self, section: Node<'_, '_>) -> Result<Rc<TypeDesc>, ErrorKind> {
        self.aliases.resolve(section).map_err(|err| match err {
            ErrorKind::MalformedDefinition { path, reason } if path == ALIAS_PATH => {
                self.malformed(reason)
            }
            other => other,
        })
    }

    fn malformed(&self, reason: String) -> ErrorKind {
        ErrorKind::MalformedDefinition {
            path: self.path.clone(),
            reason,
        }
    }
}

#[derive(Clone, Copy)]
enum MethodScope {
    Client,
    Cell,
    Base,
}

fn exposed_order(mut methods: Vec<Rc<MethodDef>>) -> Vec<Rc<MethodDef>> {
    methods.sort_by_key(|method| method.size());
    methods
}
