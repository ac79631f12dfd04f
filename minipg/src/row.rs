//! Result column descriptors and lazy row decoding.
//!
//! Row payloads are kept as the verbatim bytes of each `DataRow` (column
//! count stripped); [`value_at`] walks the length prefixed columns only when
//! a cell is actually requested.
use bytes::{Buf, Bytes};

use crate::{
    common::ByteStr,
    ext::BytesExt,
    postgres::{Oid, ProtocolError, TypeKind},
    value::{self, DecodeError, Value},
};

/// One column descriptor from a `RowDescription` message.
///
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html#PROTOCOL-MESSAGE-FORMATS-ROWDESCRIPTION>
#[derive(Debug, Clone)]
pub struct Field {
    name: ByteStr,
    table_oid: u32,
    column_index: u16,
    type_oid: Oid,
    type_size: i16,
    type_modifier: i32,
    format: u16,
    kind: Option<TypeKind>,
}

impl Field {
    pub(crate) fn parse(body: &mut Bytes) -> Result<Field, ProtocolError> {
        let name = body.get_nul_bytestr()?;
        let table_oid = body.get_u32();
        let column_index = body.get_u16();
        let type_oid = body.get_u32();
        Ok(Field {
            name,
            table_oid,
            column_index,
            type_oid,
            type_size: body.get_i16(),
            type_modifier: body.get_i32(),
            format: body.get_u16(),
            kind: TypeKind::from_oid(type_oid),
        })
    }

    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// If the field can be identified as a column of a specific table,
    /// the object ID of the table; otherwise zero.
    pub fn table_oid(&self) -> u32 {
        self.table_oid
    }

    /// If the field can be identified as a column of a specific table,
    /// the attribute number of the column; otherwise zero.
    pub fn column_index(&self) -> u16 {
        self.column_index
    }

    /// The object ID of the field's data type.
    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    /// The data type size; negative values denote variable-width types.
    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    /// The type modifier; its meaning is type-specific.
    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    /// The format code being used for the field, zero (text) or one (binary).
    pub fn format(&self) -> u16 {
        self.format
    }

    /// The semantic kind this client decodes the column as, if the type oid
    /// is in the supported catalogue.
    pub fn kind(&self) -> Option<TypeKind> {
        self.kind
    }
}

/// Walk a retained row payload up to `col` and decode the cell.
///
/// A `-1` column length denotes SQL `NULL` and yields [`Value::Null`]
/// regardless of the column type.
pub(crate) fn value_at(
    payload: &Bytes,
    fields: &[Field],
    col: usize,
) -> Result<Value, DecodeError> {
    if col >= fields.len() {
        return Err(DecodeError::ColumnNotFound(col));
    }

    let mut walk = payload.clone();
    for index in 0..=col {
        if walk.remaining() < 4 {
            return Err(DecodeError::ColumnNotFound(col));
        }
        let len = walk.get_i32();

        if len == -1 {
            if index == col {
                return Ok(Value::Null);
            }
            continue;
        }

        let len = len as usize;
        if walk.remaining() < len {
            return Err(DecodeError::Malformed { kind: "row" });
        }
        if index == col {
            return value::decode(fields[col].type_oid(), &walk[..len]);
        }
        walk.advance(len);
    }

    unreachable!("loop returns at `col`")
}
