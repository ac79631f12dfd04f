//! The binary codec between [`Value`] and the wire format of the supported
//! oid catalogue.
use bytes::{BufMut, Bytes, BytesMut};
use time::{Date, OffsetDateTime, Time, UtcOffset, macros::date};

use crate::{
    ext::UsizeExt,
    postgres::{Oid, TypeKind},
};

/// 2000-01-01T00:00:00Z, the epoch timestamps are rebased against, in unix
/// milliseconds.
const PG_EPOCH_MS: i64 = 946_684_800_000;

/// 2000-01-01, the epoch dates are rebased against.
const PG_EPOCH_DATE: Date = date!(2000 - 01 - 01);

/// A decoded or to-be-bound postgres value.
///
/// Date and time values carry millisecond precision: finer input is silently
/// truncated on encode, and the wire microseconds are floored to milliseconds
/// on decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL `NULL`, valid for every type.
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Date(Date),
    Time(Time),
    /// Time of day with a fixed utc offset.
    TimeTz { time: Time, offset: UtcOffset },
    /// A point in time; decoding always yields the UTC representation.
    Timestamp(OffsetDateTime),
    Bytea(Bytes),
    Text(String),
    Uuid(uuid::Uuid),
}

impl Value {
    /// Name of the carried kind, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int2(_) => "int2",
            Value::Int4(_) => "int4",
            Value::Int8(_) => "int8",
            Value::Float4(_) => "float4",
            Value::Float8(_) => "float8",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::TimeTz { .. } => "timetz",
            Value::Timestamp(_) => "timestamp",
            Value::Bytea(_) => "bytea",
            Value::Text(_) => "text",
            Value::Uuid(_) => "uuid",
        }
    }

    /// Returns `true` for the SQL `NULL` carrier.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// An error when binding a parameter value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodeError {
    #[error("The binding does not support the type OID: {0}")]
    UnsupportedOid(Oid),
    #[error("Incorrect value binding size: {bound} != {expected}")]
    Arity { bound: usize, expected: usize },
    #[error("cannot encode a {value} value as {kind:?}")]
    TypeMismatch { value: &'static str, kind: TypeKind },
}

/// An error when decoding a result column.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("postgres return non utf8 text: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("malformed {kind} value")]
    Malformed { kind: &'static str },
    #[error("value out of range: {0}")]
    Range(#[from] time::error::ComponentRange),
    #[error("row not found: {0}")]
    RowNotFound(usize),
    #[error("column not found: {0}")]
    ColumnNotFound(usize),
}

/// Encode the whole parameter list of a `Bind` message.
///
/// `oids` is the parameter order dictated by `ParameterDescription`; `values`
/// must match it position for position.
pub(crate) fn encode_params(oids: &[Oid], values: &[Value]) -> Result<Bytes, EncodeError> {
    if oids.len() != values.len() {
        return Err(EncodeError::Arity { bound: values.len(), expected: oids.len() });
    }

    let mut buf = BytesMut::new();
    for (oid, value) in oids.iter().zip(values) {
        encode(*oid, value, &mut buf)?;
    }
    Ok(buf.freeze())
}

/// Encode one value for `oid`, length prefix included.
///
/// Integer values widen into larger integer targets; any other kind mismatch
/// is refused.
pub(crate) fn encode(oid: Oid, value: &Value, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let Some(kind) = TypeKind::from_oid(oid) else {
        return Err(EncodeError::UnsupportedOid(oid));
    };

    match (kind, value) {
        (_, Value::Null) => buf.put_i32(-1),
        (TypeKind::Bool, Value::Bool(v)) => {
            buf.put_i32(1);
            buf.put_u8(*v as u8);
        }
        (TypeKind::Int2, Value::Int2(v)) => {
            buf.put_i32(2);
            buf.put_i16(*v);
        }
        (TypeKind::Int4, Value::Int2(v)) => {
            buf.put_i32(4);
            buf.put_i32(*v as i32);
        }
        (TypeKind::Int4, Value::Int4(v)) => {
            buf.put_i32(4);
            buf.put_i32(*v);
        }
        (TypeKind::Int8, Value::Int2(v)) => {
            buf.put_i32(8);
            buf.put_i64(*v as i64);
        }
        (TypeKind::Int8, Value::Int4(v)) => {
            buf.put_i32(8);
            buf.put_i64(*v as i64);
        }
        (TypeKind::Int8, Value::Int8(v)) => {
            buf.put_i32(8);
            buf.put_i64(*v);
        }
        (TypeKind::Float4, Value::Float4(v)) => {
            buf.put_i32(4);
            buf.put_f32(*v);
        }
        (TypeKind::Float8, Value::Float4(v)) => {
            buf.put_i32(8);
            buf.put_f64(f64::from(*v));
        }
        (TypeKind::Float8, Value::Float8(v)) => {
            buf.put_i32(8);
            buf.put_f64(*v);
        }
        (TypeKind::Date, Value::Date(v)) => {
            buf.put_i32(4);
            buf.put_i32(v.to_julian_day() - PG_EPOCH_DATE.to_julian_day());
        }
        (TypeKind::Time, Value::Time(v)) => {
            buf.put_i32(8);
            buf.put_i64(midnight_ms(*v) * 1_000);
        }
        (TypeKind::TimeTz, Value::TimeTz { time, offset }) => {
            buf.put_i32(12);
            buf.put_i64(midnight_ms(*time) * 1_000);
            // seconds east of UTC, negated on the wire
            buf.put_i32(-offset.whole_seconds());
        }
        (TypeKind::Timestamp, Value::Timestamp(v)) => {
            let unix_ms = (v.unix_timestamp_nanos() / 1_000_000) as i64;
            buf.put_i32(8);
            buf.put_i64((unix_ms - PG_EPOCH_MS) * 1_000);
        }
        (TypeKind::Bytea, Value::Bytea(v)) => {
            buf.put_i32(v.len().to_i32());
            buf.put_slice(v);
        }
        (TypeKind::Text, Value::Text(v)) => {
            buf.put_i32(v.len().to_i32());
            buf.put_slice(v.as_bytes());
        }
        (TypeKind::Uuid, Value::Uuid(v)) => {
            buf.put_i32(16);
            buf.put_slice(v.as_bytes());
        }
        (kind, value) => {
            return Err(EncodeError::TypeMismatch { value: value.kind_name(), kind });
        }
    }

    Ok(())
}

/// Decode one non-null column value for `oid`.
///
/// Oids outside the catalogue fall back to the raw [`Value::Bytea`]
/// interpretation. `NULL` columns never reach here; the row walker maps the
/// `-1` length itself.
pub(crate) fn decode(oid: Oid, raw: &[u8]) -> Result<Value, DecodeError> {
    let Some(kind) = TypeKind::from_oid(oid) else {
        return Ok(Value::Bytea(Bytes::copy_from_slice(raw)));
    };

    let value = match kind {
        TypeKind::Bool => Value::Bool(exact::<1>(raw, "bool")?[0] != 0),
        TypeKind::Int2 => Value::Int2(i16::from_be_bytes(exact(raw, "int2")?)),
        TypeKind::Int4 => Value::Int4(i32::from_be_bytes(exact(raw, "int4")?)),
        TypeKind::Int8 => Value::Int8(i64::from_be_bytes(exact(raw, "int8")?)),
        TypeKind::Float4 => Value::Float4(f32::from_be_bytes(exact(raw, "float4")?)),
        TypeKind::Float8 => Value::Float8(f64::from_be_bytes(exact(raw, "float8")?)),
        TypeKind::Date => {
            let days = i32::from_be_bytes(exact(raw, "date")?);
            Value::Date(Date::from_julian_day(PG_EPOCH_DATE.to_julian_day() + days)?)
        }
        TypeKind::Time => {
            let us = i64::from_be_bytes(exact(raw, "time")?);
            Value::Time(time_from_ms(us / 1_000)?)
        }
        TypeKind::TimeTz => {
            let raw = exact::<12>(raw, "timetz")?;
            let us = i64::from_be_bytes(raw[..8].try_into().unwrap());
            let tz = i32::from_be_bytes(raw[8..].try_into().unwrap());
            Value::TimeTz {
                time: time_from_ms(us / 1_000)?,
                offset: UtcOffset::from_whole_seconds(-tz)?,
            }
        }
        TypeKind::Timestamp => {
            let us = i64::from_be_bytes(exact(raw, "timestamp")?);
            let unix_ms = PG_EPOCH_MS + us / 1_000;
            Value::Timestamp(OffsetDateTime::from_unix_timestamp_nanos(
                unix_ms as i128 * 1_000_000,
            )?)
        }
        TypeKind::Bytea => Value::Bytea(Bytes::copy_from_slice(raw)),
        TypeKind::Text => Value::Text(std::str::from_utf8(raw)?.into()),
        TypeKind::Uuid => Value::Uuid(uuid::Uuid::from_bytes(exact(raw, "uuid")?)),
    };

    Ok(value)
}

fn exact<const N: usize>(raw: &[u8], kind: &'static str) -> Result<[u8; N], DecodeError> {
    raw.try_into().map_err(|_| DecodeError::Malformed { kind })
}

fn midnight_ms(time: Time) -> i64 {
    let (h, m, s, ms) = time.as_hms_milli();
    (i64::from(h) * 3_600 + i64::from(m) * 60 + i64::from(s)) * 1_000 + i64::from(ms)
}

fn time_from_ms(ms: i64) -> Result<Time, DecodeError> {
    let (ms, s) = (ms % 1_000, ms / 1_000);
    let (s, m) = (s % 60, s / 60);
    let (m, h) = (m % 60, m / 60);
    Ok(Time::from_hms_milli(h as u8, m as u8, s as u8, ms as u16)?)
}

#[cfg(test)]
mod test {
    use bytes::{Bytes, BytesMut};
    use time::macros::{date, datetime, offset, time};

    use super::*;

    fn wire(oid: Oid, value: &Value) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode(oid, value, &mut buf).unwrap();
        buf.to_vec()
    }

    fn roundtrip(oid: Oid, value: Value) {
        let buf = wire(oid, &value);
        assert_eq!(decode(oid, &buf[4..]).unwrap(), value, "oid {oid}");
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(16, Value::Bool(true));
        roundtrip(16, Value::Bool(false));
        roundtrip(21, Value::Int2(-1234));
        roundtrip(23, Value::Int4(i32::MIN));
        roundtrip(20, Value::Int8(i64::MAX));
        roundtrip(700, Value::Float4(13.37));
        roundtrip(701, Value::Float8(-0.25));
        roundtrip(17, Value::Bytea(Bytes::from_static(&[0, 1, 2, 255])));
        roundtrip(25, Value::Text("héllo".into()));
        roundtrip(
            2950,
            Value::Uuid(uuid::Uuid::from_bytes(*b"\x01\x02\x03\x04\x05\x06\x07\x08\x09\x0a\x0b\x0c\x0d\x0e\x0f\x10")),
        );
    }

    #[test]
    fn datetime_roundtrips() {
        roundtrip(1082, Value::Date(date!(2021 - 06 - 15)));
        roundtrip(1082, Value::Date(date!(1999 - 12 - 31)));
        roundtrip(1083, Value::Time(time!(13:26:44.517)));
        roundtrip(
            1266,
            Value::TimeTz { time: time!(13:26:44.517), offset: offset!(+3) },
        );
        roundtrip(1114, Value::Timestamp(datetime!(2021-06-15 12:34:56.789 UTC)));
        roundtrip(1184, Value::Timestamp(datetime!(1969-07-20 20:17:40 UTC)));
    }

    #[test]
    fn epoch_identity() {
        let buf = wire(1114, &Value::Timestamp(datetime!(2000-01-01 0:00 UTC)));
        assert_eq!(buf, [0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn timestamp_wire_value() {
        let buf = wire(1184, &Value::Timestamp(datetime!(2021-06-15 12:34:56.789 UTC)));
        // (1623760496789 - 946684800000) ms in us
        assert_eq!(buf[4..], 677_075_696_789_000_i64.to_be_bytes());
    }

    #[test]
    fn timetz_wire_layout() {
        let value = Value::TimeTz { time: time!(13:26:44.517), offset: offset!(+3) };
        let buf = wire(1266, &value);
        let mut expected = vec![0, 0, 0, 12];
        expected.extend_from_slice(&48_404_517_000_i64.to_be_bytes());
        expected.extend_from_slice(&(-10_800_i32).to_be_bytes());
        assert_eq!(buf, expected);
        assert_eq!(&buf[12..], [0xFF, 0xFF, 0xD5, 0xD0]);
    }

    #[test]
    fn timetz_negative_offset() {
        let buf = wire(1266, &Value::TimeTz { time: time!(0:00), offset: offset!(-5:30) });
        // -(-5h30m) = +19800
        assert_eq!(&buf[12..], 19_800_i32.to_be_bytes());
    }

    #[test]
    fn sub_millisecond_input_truncates() {
        let fine = wire(1083, &Value::Time(time!(8:00:00.123456789)));
        let coarse = wire(1083, &Value::Time(time!(8:00:00.123)));
        assert_eq!(fine, coarse);
    }

    #[test]
    fn null_encodes_for_any_oid() {
        for oid in [16, 20, 25, 1184, 2950] {
            assert_eq!(wire(oid, &Value::Null), [0xFF, 0xFF, 0xFF, 0xFF]);
        }
    }

    #[test]
    fn integers_widen() {
        assert_eq!(wire(23, &Value::Int2(7))[4..], 7_i32.to_be_bytes());
        assert_eq!(wire(20, &Value::Int4(7))[4..], 7_i64.to_be_bytes());
        assert_eq!(wire(701, &Value::Float4(0.5))[4..], 0.5_f64.to_be_bytes());
    }

    #[test]
    fn mismatch_is_refused() {
        let mut buf = BytesMut::new();
        let err = encode(16, &Value::Int4(1), &mut buf).unwrap_err();
        assert!(matches!(err, EncodeError::TypeMismatch { .. }));

        // no narrowing either
        let err = encode(21, &Value::Int8(1), &mut buf).unwrap_err();
        assert!(matches!(err, EncodeError::TypeMismatch { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn unsupported_oid_message() {
        let mut buf = BytesMut::new();
        let err = encode(600, &Value::Int4(1), &mut buf).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The binding does not support the type OID: 600",
        );
    }

    #[test]
    fn arity_mismatch_message() {
        let err = encode_params(&[23, 25], &[Value::Int4(1)]).unwrap_err();
        assert_eq!(err.to_string(), "Incorrect value binding size: 1 != 2");
    }

    #[test]
    fn unknown_oid_decodes_as_bytea() {
        let value = decode(600, &[1, 2, 3]).unwrap();
        assert_eq!(value, Value::Bytea(Bytes::from_static(&[1, 2, 3])));
    }

    #[test]
    fn int_shaped_system_oids() {
        for oid in [23, 2278, 24, 28, 29] {
            roundtrip(oid, Value::Int4(42));
        }
        for oid in [25, 18, 1043] {
            roundtrip(oid, Value::Text("t".into()));
        }
    }

    #[test]
    fn encode_params_layout() {
        let buf = encode_params(&[21, 21], &[Value::Int2(7), Value::Int2(8)]).unwrap();
        assert_eq!(
            &buf[..],
            b"\x00\x00\x00\x02\x00\x07\x00\x00\x00\x02\x00\x08",
        );
    }
}
