//! Space/index metadata cache, name resolution, and field-value coding.
//!
//! The cache is populated lazily from the server's metadata spaces and
//! invalidated when the server reports a stale schema version. Resolution
//! maps symbolic space, index, and field names to the numeric ids and
//! per-field coding the wire requires.

use std::collections::HashMap;
use std::sync::Arc;

use rmpv::Value;
use tokio::sync::Mutex;
use tracing::debug;

use tuplestore_core::protocol::constants::{VINDEX_ID, VSPACE_ID};
use tuplestore_core::protocol::request::RequestBody;
use tuplestore_core::protocol::response::Response;
use tuplestore_core::{IteratorType, Result, TupleStoreError};

use crate::connection::Transport;

/// Field value coding applied when packing and unpacking tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FieldType {
    /// Raw bytes, passed through unchanged.
    #[default]
    Str,
    /// Bytes decoded as UTF-8 on unpack.
    Utf8Str,
    /// 32-bit little-endian unsigned integer.
    Num,
    /// 64-bit little-endian unsigned integer.
    Num64,
}

impl FieldType {
    /// Maps a metadata-space type name to a field type.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "str" | "string" => Some(Self::Str),
            "utf8str" | "utf8" => Some(Self::Utf8Str),
            "num" | "unsigned" | "uint" => Some(Self::Num),
            "num64" | "unsigned64" | "u64" => Some(Self::Num64),
            _ => None,
        }
    }

    /// Codes a value for the wire according to this type.
    pub fn pack(self, value: &Value) -> Result<Value> {
        match self {
            Self::Str | Self::Utf8Str => match value {
                Value::String(_) | Value::Binary(_) => Ok(value.clone()),
                other => Err(coding_error(format!(
                    "expected string or binary for {self:?} field, got {other:?}"
                ))),
            },
            Self::Num => match value {
                Value::Integer(_) => {
                    let n = value.as_u64().filter(|v| *v <= u64::from(u32::MAX)).ok_or_else(
                        || coding_error(format!("value {value} out of range for NUM field")),
                    )?;
                    Ok(Value::Binary((n as u32).to_le_bytes().to_vec()))
                }
                Value::Binary(bytes) if bytes.len() == 4 => Ok(value.clone()),
                other => Err(coding_error(format!(
                    "expected unsigned integer for NUM field, got {other:?}"
                ))),
            },
            Self::Num64 => match value {
                Value::Integer(_) => {
                    let n = value.as_u64().ok_or_else(|| {
                        coding_error(format!("value {value} out of range for NUM64 field"))
                    })?;
                    Ok(Value::Binary(n.to_le_bytes().to_vec()))
                }
                Value::Binary(bytes) if bytes.len() == 8 => Ok(value.clone()),
                other => Err(coding_error(format!(
                    "expected unsigned integer for NUM64 field, got {other:?}"
                ))),
            },
        }
    }

    /// Decodes a wire value according to this type.
    pub fn unpack(self, value: Value) -> Result<Value> {
        match self {
            Self::Str => Ok(value),
            Self::Utf8Str => match value {
                Value::String(_) => Ok(value),
                Value::Binary(bytes) => String::from_utf8(bytes)
                    .map(Value::from)
                    .map_err(|e| coding_error(format!("invalid UTF-8 in UTF8STR field: {e}"))),
                other => Err(coding_error(format!(
                    "expected bytes for UTF8STR field, got {other:?}"
                ))),
            },
            Self::Num => match value {
                Value::Binary(bytes) if bytes.len() == 4 => {
                    let mut le = [0u8; 4];
                    le.copy_from_slice(&bytes);
                    Ok(Value::from(u32::from_le_bytes(le)))
                }
                Value::Integer(_) => Ok(value),
                other => Err(coding_error(format!(
                    "expected 4 bytes for NUM field, got {other:?}"
                ))),
            },
            Self::Num64 => match value {
                Value::Binary(bytes) if bytes.len() == 8 => {
                    let mut le = [0u8; 8];
                    le.copy_from_slice(&bytes);
                    Ok(Value::from(u64::from_le_bytes(le)))
                }
                Value::Integer(_) => Ok(value),
                other => Err(coding_error(format!(
                    "expected 8 bytes for NUM64 field, got {other:?}"
                ))),
            },
        }
    }
}

/// A field reference: symbolic name or zero-based position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldRef {
    /// Resolved through the space descriptor.
    Name(String),
    /// Used as-is.
    Index(u32),
}

impl From<&str> for FieldRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for FieldRef {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<u32> for FieldRef {
    fn from(index: u32) -> Self {
        Self::Index(index)
    }
}

/// A space reference: symbolic name or numeric id.
///
/// Numeric strings are never coerced; `Space::from("512")` addresses a space
/// literally named `"512"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Space {
    /// Resolved through the schema cache, with field coding applied.
    Named(String),
    /// Used as-is; index references must also be numeric and no coding
    /// is applied.
    Id(u32),
}

impl From<&str> for Space {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for Space {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<u32> for Space {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

/// An index reference: symbolic name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexRef {
    /// Resolved through the space descriptor.
    Named(String),
    /// Used as-is.
    Id(u32),
}

impl From<&str> for IndexRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for IndexRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

impl From<u32> for IndexRef {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

/// A field slot in a space descriptor.
///
/// Fields discovered only through an index reference have no name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceField {
    /// Symbolic field name, when declared.
    pub name: Option<String>,
    /// Coding applied to this field's values.
    pub field_type: FieldType,
}

/// One part of an index key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPart {
    /// The indexed field, by name when one is known.
    pub field: FieldRef,
    /// Coding applied to this key part.
    pub field_type: FieldType,
}

/// An ordered access path over one or more fields of a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Numeric index id.
    pub id: u32,
    /// Symbolic index name.
    pub name: String,
    /// Key parts in index order.
    pub parts: Vec<IndexPart>,
}

/// Cached metadata for one space.
#[derive(Debug, Clone)]
pub struct SpaceDescriptor {
    id: u32,
    name: String,
    fields: Vec<SpaceField>,
    default_field_type: FieldType,
    indexes: HashMap<u32, IndexDescriptor>,
    index_ids_by_name: HashMap<String, u32>,
}

impl SpaceDescriptor {
    /// Creates a descriptor with the given declared fields.
    pub fn new(
        id: u32,
        name: impl Into<String>,
        fields: Vec<SpaceField>,
        default_field_type: FieldType,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            fields,
            default_field_type,
            indexes: HashMap::new(),
            index_ids_by_name: HashMap::new(),
        }
    }

    /// Returns the numeric space id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the symbolic space name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the ordered field list.
    pub fn fields(&self) -> &[SpaceField] {
        &self.fields
    }

    /// Returns `true` when the descriptor has neither fields nor indexes.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.indexes.is_empty()
    }

    /// Registers an index.
    ///
    /// # Errors
    ///
    /// Returns a schema error when the index id or name is already taken.
    pub fn add_index(&mut self, index: IndexDescriptor) -> Result<()> {
        if self.indexes.contains_key(&index.id) {
            return Err(schema_error(format!(
                "duplicate index id {} in space '{}'",
                index.id, self.name
            )));
        }
        if self.index_ids_by_name.contains_key(&index.name) {
            return Err(schema_error(format!(
                "duplicate index name '{}' in space '{}'",
                index.name, self.name
            )));
        }
        self.index_ids_by_name.insert(index.name.clone(), index.id);
        self.indexes.insert(index.id, index);
        Ok(())
    }

    /// Returns the zero-based position of a named field.
    pub fn field_position(&self, name: &str) -> Option<u32> {
        self.fields
            .iter()
            .position(|f| f.name.as_deref() == Some(name))
            .map(|p| p as u32)
    }

    /// Returns the coding for the field at `position`.
    ///
    /// Fields past the declared prefix use the space's default type.
    pub fn field_type_at(&self, position: usize) -> FieldType {
        self.fields
            .get(position)
            .map(|f| f.field_type)
            .unwrap_or(self.default_field_type)
    }

    /// Resolves a field reference to its position.
    pub fn resolve_field(&self, field: &FieldRef) -> Result<u32> {
        match field {
            FieldRef::Index(position) => Ok(*position),
            FieldRef::Name(name) => self.field_position(name).ok_or_else(|| {
                schema_error(format!("no field '{}' in space '{}'", name, self.name))
            }),
        }
    }

    /// Resolves an index reference to its descriptor.
    pub fn index(&self, index: &IndexRef) -> Result<&IndexDescriptor> {
        let id = match index {
            IndexRef::Id(id) => *id,
            IndexRef::Named(name) => *self.index_ids_by_name.get(name).ok_or_else(|| {
                schema_error(format!("no index '{}' in space '{}'", name, self.name))
            })?,
        };
        self.indexes.get(&id).ok_or_else(|| {
            schema_error(format!("no index {} in space '{}'", id, self.name))
        })
    }

    /// Codes a full tuple for the wire.
    pub fn pack_tuple(&self, values: &[Value]) -> Result<Vec<Value>> {
        values
            .iter()
            .enumerate()
            .map(|(position, value)| self.field_type_at(position).pack(value))
            .collect()
    }

    /// Decodes a wire tuple into typed values.
    pub fn unpack_tuple(&self, values: Vec<Value>) -> Result<Vec<Value>> {
        values
            .into_iter()
            .enumerate()
            .map(|(position, value)| self.field_type_at(position).unpack(value))
            .collect()
    }

    /// Codes key values against an index's part types.
    pub fn pack_key(&self, index: &IndexDescriptor, key: &[Value]) -> Result<Vec<Value>> {
        if key.len() > index.parts.len() {
            return Err(schema_error(format!(
                "key has {} parts but index '{}' has {}",
                key.len(),
                index.name,
                index.parts.len()
            )));
        }
        key.iter()
            .zip(index.parts.iter())
            .map(|(value, part)| part.field_type.pack(value))
            .collect()
    }
}

/// The container of all known space descriptors.
///
/// Names and numeric ids are unique across the container.
#[derive(Debug, Clone, Default)]
pub struct Spaces {
    by_name: HashMap<String, Arc<SpaceDescriptor>>,
    names_by_id: HashMap<u32, String>,
}

impl Spaces {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a schema error when the name or numeric id is already taken.
    pub fn insert(&mut self, descriptor: SpaceDescriptor) -> Result<()> {
        if self.by_name.contains_key(descriptor.name()) {
            return Err(schema_error(format!(
                "duplicate space name '{}'",
                descriptor.name()
            )));
        }
        if self.names_by_id.contains_key(&descriptor.id()) {
            return Err(schema_error(format!(
                "duplicate space id {}",
                descriptor.id()
            )));
        }
        self.names_by_id.insert(descriptor.id(), descriptor.name().to_string());
        self.by_name
            .insert(descriptor.name().to_string(), Arc::new(descriptor));
        Ok(())
    }

    /// Looks a descriptor up by name.
    pub fn get(&self, name: &str) -> Option<Arc<SpaceDescriptor>> {
        self.by_name.get(name).cloned()
    }

    /// Looks a descriptor up by numeric id.
    pub fn get_by_id(&self, id: u32) -> Option<Arc<SpaceDescriptor>> {
        self.names_by_id.get(&id).and_then(|name| self.get(name))
    }

    /// Returns the number of known spaces.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns `true` when no spaces are known.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    spaces: Option<Spaces>,
    version: Option<u64>,
}

/// The per-client schema cache.
///
/// Discovery is serialized behind a mutex so that exactly one metadata
/// refresh runs between a stale-schema reply and its retry, no matter how
/// many operations race on the invalidated cache.
#[derive(Debug)]
pub(crate) struct SchemaCache {
    default_field_type: FieldType,
    prebuilt: bool,
    state: Mutex<CacheState>,
}

impl SchemaCache {
    pub(crate) fn new(prebuilt: Option<Spaces>, default_field_type: FieldType) -> Self {
        Self {
            default_field_type,
            prebuilt: prebuilt.is_some(),
            state: Mutex::new(CacheState {
                spaces: prebuilt,
                version: None,
            }),
        }
    }

    /// Returns the cached schema version, if any.
    pub(crate) async fn version(&self) -> Option<u64> {
        self.state.lock().await.version
    }

    /// Resolves a space name, running discovery when the cache is empty.
    pub(crate) async fn descriptor(
        &self,
        transport: &Transport,
        name: &str,
    ) -> Result<(Arc<SpaceDescriptor>, Option<u64>)> {
        let mut state = self.state.lock().await;
        if state.spaces.is_none() {
            let (spaces, version) = self.discover(transport).await?;
            debug!(spaces = spaces.len(), version, "schema discovered");
            state.spaces = Some(spaces);
            state.version = Some(version);
        }
        let spaces = state.spaces.as_ref().expect("populated above");
        let descriptor = spaces
            .get(name)
            .ok_or_else(|| schema_error(format!("no such space '{name}'")))?;
        Ok((descriptor, state.version))
    }

    /// Drops the cached container so the next lookup re-runs discovery.
    pub(crate) async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if !self.prebuilt {
            state.spaces = None;
        }
        state.version = None;
        debug!("schema cache invalidated");
    }

    async fn discover(&self, transport: &Transport) -> Result<(Spaces, u64)> {
        let select_all = |space_id| RequestBody::Select {
            space_id,
            index_id: 0,
            limit: u32::MAX,
            offset: 0,
            iterator: IteratorType::All,
            key: Vec::new(),
        };

        let space_rows = expect_data(transport.invoke(select_all(VSPACE_ID), None).await?)?;
        let index_rows = expect_data(transport.invoke(select_all(VINDEX_ID), None).await?)?;

        let ping = transport.invoke(RequestBody::Ping, None).await?;
        if let Some(err) = ping.to_error() {
            return Err(err);
        }
        let version = ping.schema_version.ok_or_else(|| {
            TupleStoreError::Protocol("ping reply carries no schema version".to_string())
        })?;

        let spaces = build_spaces(space_rows, index_rows, self.default_field_type)?;
        Ok((spaces, version))
    }
}

fn expect_data(response: Response) -> Result<Vec<Value>> {
    match response.to_error() {
        Some(err) => Err(err),
        None => Ok(response.into_data()),
    }
}

fn build_spaces(
    space_rows: Vec<Value>,
    index_rows: Vec<Value>,
    default_field_type: FieldType,
) -> Result<Spaces> {
    let mut descriptors: HashMap<u32, SpaceDescriptor> = HashMap::new();
    let mut order: Vec<u32> = Vec::new();

    for row in space_rows {
        if let Some((id, name, fields)) = parse_space_row(&row, default_field_type)? {
            order.push(id);
            descriptors.insert(
                id,
                SpaceDescriptor::new(id, name, fields, default_field_type),
            );
        }
    }

    for row in index_rows {
        let Some((space_id, index_id, name, parts)) = parse_index_row(&row)? else {
            continue;
        };
        // Indexes of skipped (server-internal) spaces are ignored.
        let Some(descriptor) = descriptors.get_mut(&space_id) else {
            continue;
        };

        let mut index_parts = Vec::with_capacity(parts.len());
        for (field_no, field_type) in parts {
            let position = field_no as usize;
            // A part may reference a field past the declared prefix; extend
            // the field list with the index-derived type.
            while descriptor.fields.len() <= position {
                let slot_type = if descriptor.fields.len() == position {
                    field_type
                } else {
                    default_field_type
                };
                descriptor.fields.push(SpaceField {
                    name: None,
                    field_type: slot_type,
                });
            }
            let field = match &descriptor.fields[position].name {
                Some(name) => FieldRef::Name(name.clone()),
                None => FieldRef::Index(field_no),
            };
            index_parts.push(IndexPart { field, field_type });
        }

        descriptor.add_index(IndexDescriptor {
            id: index_id,
            name,
            parts: index_parts,
        })?;
    }

    let mut spaces = Spaces::new();
    for id in order {
        let descriptor = descriptors.remove(&id).expect("inserted above");
        if descriptor.is_empty() {
            debug!(space = descriptor.name(), "dropping space without fields or indexes");
            continue;
        }
        spaces.insert(descriptor)?;
    }
    Ok(spaces)
}

/// Parses one `_vspace` row. Returns `None` for server-internal spaces.
fn parse_space_row(
    row: &Value,
    default_field_type: FieldType,
) -> Result<Option<(u32, String, Vec<SpaceField>)>> {
    let Value::Array(items) = row else {
        return Err(metadata_error("space row is not an array"));
    };

    let id = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| metadata_error("space row has no numeric id"))? as u32;
    let name = match items.get(2) {
        Some(Value::String(s)) => s
            .as_str()
            .ok_or_else(|| metadata_error("space name is not UTF-8"))?
            .to_string(),
        _ => return Err(metadata_error("space row has no name")),
    };

    if name.starts_with('_') {
        return Ok(None);
    }

    let mut fields = Vec::new();
    if let Some(Value::Array(format)) = items.get(6) {
        for entry in format {
            fields.push(parse_format_entry(entry, default_field_type)?);
        }
    }

    Ok(Some((id, name, fields)))
}

fn parse_format_entry(entry: &Value, default_field_type: FieldType) -> Result<SpaceField> {
    let Value::Map(pairs) = entry else {
        return Err(metadata_error("space format entry is not a map"));
    };

    let mut name = None;
    let mut field_type = default_field_type;
    for (key, value) in pairs {
        let Some(key) = key.as_str() else { continue };
        match (key, value) {
            ("name", Value::String(s)) => name = s.as_str().map(str::to_owned),
            ("type", Value::String(s)) => {
                if let Some(parsed) = s.as_str().and_then(FieldType::from_wire_name) {
                    field_type = parsed;
                }
            }
            _ => {}
        }
    }

    Ok(SpaceField { name, field_type })
}

/// Parses one `_vindex` row into `(space_id, index_id, name, parts)`.
fn parse_index_row(row: &Value) -> Result<Option<(u32, u32, String, Vec<(u32, FieldType)>)>> {
    let Value::Array(items) = row else {
        return Err(metadata_error("index row is not an array"));
    };

    let space_id = items
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| metadata_error("index row has no space id"))? as u32;
    let index_id = items
        .get(1)
        .and_then(Value::as_u64)
        .ok_or_else(|| metadata_error("index row has no index id"))? as u32;
    let name = match items.get(2) {
        Some(Value::String(s)) => s
            .as_str()
            .ok_or_else(|| metadata_error("index name is not UTF-8"))?
            .to_string(),
        _ => return Err(metadata_error("index row has no name")),
    };

    let mut parts = Vec::new();
    if let Some(Value::Array(raw_parts)) = items.get(5) {
        for part in raw_parts {
            parts.push(parse_index_part(part)?);
        }
    }

    Ok(Some((space_id, index_id, name, parts)))
}

/// Accepts both the array form `[field_no, type]` and the map form
/// `{"field": n, "type": t}` used by newer server versions.
fn parse_index_part(part: &Value) -> Result<(u32, FieldType)> {
    match part {
        Value::Array(items) => {
            let field_no = items
                .first()
                .and_then(Value::as_u64)
                .ok_or_else(|| metadata_error("index part has no field number"))?
                as u32;
            let field_type = items
                .get(1)
                .and_then(|v| match v {
                    Value::String(s) => s.as_str().and_then(FieldType::from_wire_name),
                    _ => None,
                })
                .unwrap_or_default();
            Ok((field_no, field_type))
        }
        Value::Map(pairs) => {
            let mut field_no = None;
            let mut field_type = FieldType::default();
            for (key, value) in pairs {
                match (key.as_str(), value) {
                    (Some("field"), v) => field_no = v.as_u64().map(|n| n as u32),
                    (Some("type"), Value::String(s)) => {
                        if let Some(parsed) = s.as_str().and_then(FieldType::from_wire_name) {
                            field_type = parsed;
                        }
                    }
                    _ => {}
                }
            }
            let field_no =
                field_no.ok_or_else(|| metadata_error("index part has no field number"))?;
            Ok((field_no, field_type))
        }
        other => Err(metadata_error(format!(
            "index part is neither array nor map: {other:?}"
        ))),
    }
}

fn coding_error(detail: impl Into<String>) -> TupleStoreError {
    TupleStoreError::Coding(detail.into())
}

fn schema_error(detail: impl Into<String>) -> TupleStoreError {
    TupleStoreError::Schema(detail.into())
}

fn metadata_error(detail: impl Into<String>) -> TupleStoreError {
    TupleStoreError::Protocol(format!("malformed metadata: {}", detail.into()))
}
