//! Decoded result tuples with positional and named field access.

use std::sync::Arc;

use rmpv::Value;

use tuplestore_core::{Result, TupleStoreError};

use crate::schema::SpaceDescriptor;

/// One tuple returned by an operation.
///
/// When the operation ran against a known space descriptor, fields are
/// decoded by their declared types and can also be addressed by name.
/// Otherwise the raw wire values are kept.
#[derive(Debug, Clone)]
pub struct Tuple {
    fields: Vec<Value>,
    descriptor: Option<Arc<SpaceDescriptor>>,
}

impl Tuple {
    pub(crate) fn decode(row: Value, descriptor: Option<Arc<SpaceDescriptor>>) -> Result<Self> {
        let fields = match row {
            Value::Array(fields) => fields,
            other => {
                return Err(TupleStoreError::Protocol(format!(
                    "tuple row is not an array: {other:?}"
                )))
            }
        };
        let fields = match &descriptor {
            Some(descriptor) => descriptor.unpack_tuple(fields)?,
            None => fields,
        };
        Ok(Self { fields, descriptor })
    }

    pub(crate) fn decode_rows(
        rows: Vec<Value>,
        descriptor: Option<Arc<SpaceDescriptor>>,
    ) -> Result<Vec<Self>> {
        rows.into_iter()
            .map(|row| Self::decode(row, descriptor.clone()))
            .collect()
    }

    /// Returns the field at `position`.
    pub fn get(&self, position: usize) -> Option<&Value> {
        self.fields.get(position)
    }

    /// Returns the field with the given declared name.
    ///
    /// Always `None` for tuples decoded without a descriptor.
    pub fn field(&self, name: &str) -> Option<&Value> {
        let descriptor = self.descriptor.as_ref()?;
        self.fields.get(descriptor.field_position(name)? as usize)
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` when the tuple has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the decoded fields as a slice.
    pub fn values(&self) -> &[Value] {
        &self.fields
    }

    /// Consumes the tuple, returning its fields.
    pub fn into_values(self) -> Vec<Value> {
        self.fields
    }

    /// Iterates over the fields in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.fields.iter()
    }
}

impl IntoIterator for Tuple {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Tuple {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}
