/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// The closed set of value kinds this client can encode and decode.
///
/// Every kind maps from one or more catalogue oids; anything outside the
/// table decodes as raw [`Bytea`][TypeKind::Bytea] and refuses to encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// `bool`, 1 byte, zero is false.
    Bool,
    /// `int2`, big-endian signed 16.
    Int2,
    /// `int4` and the int-shaped system types (`oid`, `regproc`, `xid`, `cid`).
    Int4,
    /// `int8`, big-endian signed 64.
    Int8,
    /// `float4`, big-endian IEEE-754 single.
    Float4,
    /// `float8`, big-endian IEEE-754 double.
    Float8,
    /// `date`, days since 2000-01-01.
    Date,
    /// `time`, microseconds since midnight.
    Time,
    /// `timetz`, microseconds since midnight plus negated utc offset seconds.
    TimeTz,
    /// `timestamp` and `timestamptz`, microseconds since 2000-01-01T00:00:00Z.
    Timestamp,
    /// `bytea`, raw bytes.
    Bytea,
    /// `text`, `char` and `varchar`, utf-8.
    Text,
    /// `uuid`, RFC 4122 big-endian byte layout.
    Uuid,
}

impl TypeKind {
    /// Lookup the kind for a catalogue oid.
    pub fn from_oid(oid: Oid) -> Option<TypeKind> {
        let kind = match oid {
            16 => TypeKind::Bool,
            21 => TypeKind::Int2,
            23 | 2278 | 24 | 28 | 29 => TypeKind::Int4,
            20 => TypeKind::Int8,
            700 => TypeKind::Float4,
            701 => TypeKind::Float8,
            1082 => TypeKind::Date,
            1083 => TypeKind::Time,
            1266 => TypeKind::TimeTz,
            1114 | 1184 => TypeKind::Timestamp,
            17 => TypeKind::Bytea,
            25 | 18 | 1043 => TypeKind::Text,
            2950 => TypeKind::Uuid,
            _ => return None,
        };
        Some(kind)
    }
}
