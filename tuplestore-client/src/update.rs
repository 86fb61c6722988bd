//! Update operations for `update` and `upsert`.

use rmpv::Value;

use tuplestore_core::{Result, TupleStoreError};

use crate::schema::{FieldRef, SpaceDescriptor};

/// One update operation, applied to a single field.
///
/// Operations are applied in order. The target field may be referenced by
/// name (resolved through the space descriptor) or by position; arguments
/// are coded according to the target field's declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Set the field to a value (`=`).
    Assign {
        /// Target field.
        field: FieldRef,
        /// New value.
        value: Value,
    },
    /// Add to a numeric field (`+`).
    Add {
        /// Target field.
        field: FieldRef,
        /// Amount to add.
        amount: u64,
    },
    /// Subtract from a numeric field (`-`).
    Subtract {
        /// Target field.
        field: FieldRef,
        /// Amount to subtract.
        amount: u64,
    },
    /// Bitwise AND with a mask (`&`).
    BitAnd {
        /// Target field.
        field: FieldRef,
        /// The mask.
        mask: u64,
    },
    /// Bitwise OR with a mask (`|`).
    BitOr {
        /// Target field.
        field: FieldRef,
        /// The mask.
        mask: u64,
    },
    /// Bitwise XOR with a mask (`^`).
    BitXor {
        /// Target field.
        field: FieldRef,
        /// The mask.
        mask: u64,
    },
    /// Splice the field's bytes (`:`): remove `length` bytes at `offset`,
    /// then insert `replacement` there. Offsets past the end clamp to it.
    Splice {
        /// Target field.
        field: FieldRef,
        /// Byte offset of the edit.
        offset: u32,
        /// Number of bytes to remove.
        length: u32,
        /// Bytes to insert.
        replacement: Vec<u8>,
    },
    /// Remove the field from the tuple (`#`).
    Delete {
        /// Target field.
        field: FieldRef,
    },
    /// Insert a new field at the given position (`!`).
    Insert {
        /// Position the new field lands at.
        field: FieldRef,
        /// The inserted value.
        value: Value,
    },
}

impl UpdateOp {
    /// Set a field (`=`).
    pub fn assign(field: impl Into<FieldRef>, value: Value) -> Self {
        Self::Assign {
            field: field.into(),
            value,
        }
    }

    /// Add to a numeric field (`+`).
    pub fn add(field: impl Into<FieldRef>, amount: u64) -> Self {
        Self::Add {
            field: field.into(),
            amount,
        }
    }

    /// Subtract from a numeric field (`-`).
    pub fn subtract(field: impl Into<FieldRef>, amount: u64) -> Self {
        Self::Subtract {
            field: field.into(),
            amount,
        }
    }

    /// Bitwise AND (`&`).
    pub fn bit_and(field: impl Into<FieldRef>, mask: u64) -> Self {
        Self::BitAnd {
            field: field.into(),
            mask,
        }
    }

    /// Bitwise OR (`|`).
    pub fn bit_or(field: impl Into<FieldRef>, mask: u64) -> Self {
        Self::BitOr {
            field: field.into(),
            mask,
        }
    }

    /// Bitwise XOR (`^`).
    pub fn bit_xor(field: impl Into<FieldRef>, mask: u64) -> Self {
        Self::BitXor {
            field: field.into(),
            mask,
        }
    }

    /// Splice the field's bytes (`:`).
    pub fn splice(
        field: impl Into<FieldRef>,
        offset: u32,
        length: u32,
        replacement: impl Into<Vec<u8>>,
    ) -> Self {
        Self::Splice {
            field: field.into(),
            offset,
            length,
            replacement: replacement.into(),
        }
    }

    /// Remove a field (`#`).
    pub fn delete(field: impl Into<FieldRef>) -> Self {
        Self::Delete {
            field: field.into(),
        }
    }

    /// Insert a new field (`!`).
    pub fn insert(field: impl Into<FieldRef>, value: Value) -> Self {
        Self::Insert {
            field: field.into(),
            value,
        }
    }

    fn field(&self) -> &FieldRef {
        match self {
            Self::Assign { field, .. }
            | Self::Add { field, .. }
            | Self::Subtract { field, .. }
            | Self::BitAnd { field, .. }
            | Self::BitOr { field, .. }
            | Self::BitXor { field, .. }
            | Self::Splice { field, .. }
            | Self::Delete { field }
            | Self::Insert { field, .. } => field,
        }
    }

    /// Encodes this operation as its wire array `[op, field, args...]`.
    ///
    /// Without a descriptor (numeric-space path) field names are rejected
    /// and values pass through uncoded.
    pub(crate) fn encode(&self, descriptor: Option<&SpaceDescriptor>) -> Result<Value> {
        let field_no = match (descriptor, self.field()) {
            (Some(descriptor), field) => descriptor.resolve_field(field)?,
            (None, FieldRef::Index(position)) => *position,
            (None, FieldRef::Name(name)) => {
                return Err(TupleStoreError::Schema(format!(
                    "field name '{name}' requires a named space"
                )))
            }
        };

        let code_value = |value: &Value| -> Result<Value> {
            match descriptor {
                Some(descriptor) => descriptor.field_type_at(field_no as usize).pack(value),
                None => Ok(value.clone()),
            }
        };

        let parts = match self {
            Self::Assign { value, .. } => vec![
                Value::from("="),
                Value::from(field_no),
                code_value(value)?,
            ],
            Self::Add { amount, .. } => vec![
                Value::from("+"),
                Value::from(field_no),
                Value::from(*amount),
            ],
            Self::Subtract { amount, .. } => vec![
                Value::from("-"),
                Value::from(field_no),
                Value::from(*amount),
            ],
            Self::BitAnd { mask, .. } => vec![
                Value::from("&"),
                Value::from(field_no),
                Value::from(*mask),
            ],
            Self::BitOr { mask, .. } => vec![
                Value::from("|"),
                Value::from(field_no),
                Value::from(*mask),
            ],
            Self::BitXor { mask, .. } => vec![
                Value::from("^"),
                Value::from(field_no),
                Value::from(*mask),
            ],
            Self::Splice {
                offset,
                length,
                replacement,
                ..
            } => vec![
                Value::from(":"),
                Value::from(field_no),
                Value::from(*offset),
                Value::from(*length),
                Value::Binary(replacement.clone()),
            ],
            Self::Delete { .. } => vec![
                Value::from("#"),
                Value::from(field_no),
                Value::from(1u32),
            ],
            Self::Insert { value, .. } => vec![
                Value::from("!"),
                Value::from(field_no),
                code_value(value)?,
            ],
        };
        Ok(Value::Array(parts))
    }
}
