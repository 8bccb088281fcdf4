use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::ErrorKind;
use crate::rpc::entitydefs::{EntityDef, PropertyDef};
use crate::rpc::typedefs::ArgValue;
use crate::types::{EntityId, Vec3};
use crate::{IResult, Rc};

/// A live game object, typed by its [`EntityDef`].
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    def: Rc<EntityDef>,
    client: HashMap<String, ArgValue>,
    cell: HashMap<String, ArgValue>,
    base: HashMap<String, ArgValue>,
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    in_aoi: bool,
}

impl Entity {
    pub fn new(id: EntityId, def: Rc<EntityDef>) -> Self {
        Entity {
            id,
            def,
            client: HashMap::new(),
            cell: HashMap::new(),
            base: HashMap::new(),
            position: Vec3::default(),
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            in_aoi: false,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn def(&self) -> &Rc<EntityDef> {
        &self.def
    }

    /// Entity type name, e.g. `Vehicle`.
    pub fn type_name(&self) -> &str {
        self.def.name()
    }

    pub fn is_in_aoi(&self) -> bool {
        self.in_aoi
    }

    pub fn set_in_aoi(&mut self, in_aoi: bool) {
        self.in_aoi = in_aoi;
    }

    pub fn client_property(&self, name: &str) -> Option<&ArgValue> {
        self.client.get(name)
    }

    pub fn client_property_mut(&mut self, name: &str) -> Option<&mut ArgValue> {
        self.client.get_mut(name)
    }

    pub fn cell_property(&self, name: &str) -> Option<&ArgValue> {
        self.cell.get(name)
    }

    pub fn base_property(&self, name: &str) -> Option<&ArgValue> {
        self.base.get(name)
    }

    pub fn client_properties(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.client.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn set_transform(&mut self, position: Vec3, yaw: f32, pitch: f32, roll: f32) {
        self.position = position;
        self.yaw = yaw;
        self.pitch = pitch;
        self.roll = roll;
    }

    /// Copies the transform of `other`, used when a player is attached to another entity.
    pub fn copy_transform(&mut self, other: &Entity) {
        self.set_transform(other.position, other.yaw, other.pitch, other.roll);
    }

    /// Decodes the client property with wire index `index` from `i` and stores it.
    pub fn set_client_property<'a>(
        &mut self,
        index: usize,
        i: &'a [u8],
    ) -> IResult<&'a [u8], String> {
        let prop = self.def.client_property(index).map_err(lift)?.clone();
        store(&mut self.client, self.id, &prop, i)
    }

    pub fn set_client_property_internal<'a>(
        &mut self,
        index: usize,
        i: &'a [u8],
    ) -> IResult<&'a [u8], String> {
        let prop = self.def.client_property_internal(index).map_err(lift)?.clone();
        store(&mut self.client, self.id, &prop, i)
    }

    pub fn set_cell_property<'a>(&mut self, index: usize, i: &'a [u8]) -> IResult<&'a [u8], String> {
        let prop = self.def.cell_property(index).map_err(lift)?.clone();
        store(&mut self.cell, self.id, &prop, i)
    }

    pub fn set_base_property<'a>(&mut self, index: usize, i: &'a [u8]) -> IResult<&'a [u8], String> {
        let prop = self.def.base_property(index).map_err(lift)?.clone();
        store(&mut self.base, self.id, &prop, i)
    }

    /// Name of the client method with wire index `index`.
    pub fn client_method_name(&self, index: usize) -> Result<&str, ErrorKind> {
        Ok(self.def.client_method(index)?.name.as_str())
    }

    pub fn decode_client_method(&self, index: usize, i: &[u8]) -> Result<MethodCall, ErrorKind> {
        let method = self.def.client_method(index)?;
        let (rest, values) = method.parse_args(i)?;
        if !rest.is_empty() {
            trace!(
                "{}.{} left {} bytes unread",
                self.type_name(),
                method.name,
                rest.len()
            );
        }

        Ok(MethodCall {
            name: method.name.clone(),
            args: MethodArgs {
                names: method.args.iter().map(|arg| arg.name.clone()).collect(),
                values,
            },
        })
    }
}

fn lift(kind: ErrorKind) -> nom::Err<crate::error::Error> {
    nom::Err::Failure(kind.into())
}

fn store<'a>(
    bucket: &mut HashMap<String, ArgValue>,
    id: EntityId,
    prop: &PropertyDef,
    i: &'a [u8],
) -> IResult<&'a [u8], String> {
    let (i, value) = prop.parse(i)?;
    debug!("entity {} property {} = {:?}", id, prop.name, value);
    bucket.insert(prop.name.clone(), value);
    Ok((i, prop.name.clone()))
}

/// A decoded client method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub name: String,
    pub args: MethodArgs,
}

/// Ordered method arguments, named where the definition names them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodArgs {
    names: Vec<Option<String>>,
    values: Vec<ArgValue>,
}

impl MethodArgs {
    pub fn new(names: Vec<Option<String>>, values: Vec<ArgValue>) -> Self {
        MethodArgs { names, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ArgValue> {
        self.values.get(index)
    }

    pub fn by_name(&self, name: &str) -> Option<&ArgValue> {
        self.names
            .iter()
            .position(|arg| arg.as_deref() == Some(name))
            .and_then(|idx| self.values.get(idx))
    }

    pub fn values(&self) -> &[ArgValue] {
        &self.values
    }

    /// Returns exactly `N` arguments, or `HandlerArity` naming `handler`.
    pub fn expect<const N: usize>(&self, handler: &'static str) -> Result<[&ArgValue; N], ErrorKind> {
        if self.values.len() != N {
            return Err(ErrorKind::HandlerArity {
                handler,
                expected: N,
                got: self.values.len(),
            });
        }
        Ok(std::array::from_fn(|idx| &self.values[idx]))
    }
}

pub type PropertyHandler<C> = fn(&mut C, &Entity, &ArgValue) -> Result<(), ErrorKind>;
pub type MethodHandler<C> = fn(&mut C, &Entity, &MethodArgs) -> Result<(), ErrorKind>;
/// Receives the patched leaf container.
pub type NestedHandler<C> = fn(&mut C, &Entity, &ArgValue) -> Result<(), ErrorKind>;

/// One handler registration. Bindings are collected into a [`DispatchTable`].
pub enum Binding<C> {
    Property {
        entity_type: &'static str,
        property: &'static str,
        handler: PropertyHandler<C>,
    },
    Method {
        entity_type: &'static str,
        method: &'static str,
        handler: MethodHandler<C>,
    },
    NestedProperty {
        entity_type: &'static str,
        path: &'static str,
        handler: NestedHandler<C>,
    },
}

/// Handlers for a single decode session, looked up by entity type and member.
pub struct DispatchTable<C> {
    properties: HandlerMap<PropertyHandler<C>>,
    methods: HandlerMap<MethodHandler<C>>,
    nested: HashMap<&'static str, Vec<(&'static str, NestedHandler<C>)>>,
}

impl<C> DispatchTable<C> {
    pub fn new(bindings: impl IntoIterator<Item = Binding<C>>) -> Self {
        let mut table = DispatchTable {
            properties: HashMap::new(),
            methods: HashMap::new(),
            nested: HashMap::new(),
        };
        for binding in bindings {
            match binding {
                Binding::Property {
                    entity_type,
                    property,
                    handler,
                } => table
                    .properties
                    .entry(entity_type)
                    .or_default()
                    .entry(property)
                    .or_default()
                    .push(handler),
                Binding::Method {
                    entity_type,
                    method,
                    handler,
                } => table
                    .methods
                    .entry(entity_type)
                    .or_default()
                    .entry(method)
                    .or_default()
                    .push(handler),
                Binding::NestedProperty {
                    entity_type,
                    path,
                    handler,
                } => table
                    .nested
                    .entry(entity_type)
                    .or_default()
                    .push((path, handler)),
            }
        }
        table
    }

    pub fn property_handlers(&self, entity_type: &str, property: &str) -> &[PropertyHandler<C>] {
        lookup(&self.properties, entity_type, property)
    }

    pub fn method_handlers(&self, entity_type: &str, method: &str) -> &[MethodHandler<C>] {
        lookup(&self.methods, entity_type, method)
    }

    pub fn has_method_handlers(&self, entity_type: &str, method: &str) -> bool {
        !self.method_handlers(entity_type, method).is_empty()
    }

    /// Handlers whose registered path equals `path` or is a dotted prefix of it.
    pub fn nested_handlers<'s>(
        &'s self,
        entity_type: &str,
        path: &'s str,
    ) -> impl Iterator<Item = NestedHandler<C>> + 's {
        self.nested
            .get(entity_type)
            .into_iter()
            .flatten()
            .filter(move |(registered, _)| path_matches(registered, path))
            .map(|(_, handler)| *handler)
    }

    pub fn len(&self) -> usize {
        count(&self.properties) + count(&self.methods)
            + self.nested.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Entity type, then property or method name, to the ordered handler list.
type HandlerMap<H> = HashMap<&'static str, HashMap<&'static str, Vec<H>>>;

fn lookup<'t, H>(table: &'t HandlerMap<H>, entity_type: &str, member: &str) -> &'t [H] {
    table
        .get(entity_type)
        .and_then(|members| members.get(member))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn count<H>(table: &HandlerMap<H>) -> usize {
    table.values().flat_map(HashMap::values).map(Vec::len).sum()
}

fn path_matches(registered: &str, path: &str) -> bool {
    match path.strip_prefix(registered) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}
