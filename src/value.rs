//! SQL literal coercion and the legacy UUID binary encoding.
//!
//! Collections whose names begin with an uppercase ASCII letter store
//! identifiers as 16-byte binaries of subtype 3 with a legacy byte order;
//! everything else stores them as plain strings. The helpers here classify
//! collection names and fields and coerce literal values accordingly.

use bson::{spec::BinarySubtype, Binary, Bson};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::Value as SqlValue;
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$",
    )
    .expect("uuid pattern compiles")
});

/// Lower a SQL literal to its BSON form. Numeric parse failures degrade to
/// the original string rather than aborting the translation.
pub fn literal(value: &SqlValue) -> Bson {
    match value {
        SqlValue::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                match i32::try_from(i) {
                    Ok(small) => Bson::Int32(small),
                    Err(_) => Bson::Int64(i),
                }
            } else if let Ok(f) = n.parse::<f64>() {
                Bson::Double(f)
            } else {
                debug!(literal = %n, "numeric literal did not parse, keeping string form");
                Bson::String(n.clone())
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Bson::String(s.clone())
        }
        SqlValue::HexStringLiteral(s) => match i64::from_str_radix(s, 16) {
            Ok(i) => Bson::Int64(i),
            Err(_) => Bson::String(s.clone()),
        },
        SqlValue::Boolean(b) => Bson::Boolean(*b),
        SqlValue::Null => Bson::Null,
        other => Bson::String(other.to_string()),
    }
}

/// A collection is binary-id when its name starts with an uppercase ASCII
/// letter; its UUID identifiers are stored as legacy binaries.
pub fn is_binary_id_collection(name: &str) -> bool {
    name.chars().next().map_or(false, |c| c.is_ascii_uppercase())
}

/// Whether a field holds identifiers: `_id`, a `…Id` suffix, or the legacy
/// `Accounts` array on binary-id collections.
pub fn is_id_field(field: &str, collection: &str) -> bool {
    field == "_id"
        || field.ends_with("Id")
        || (field == "Accounts" && is_binary_id_collection(collection))
}

pub fn is_uuid(value: &str) -> bool {
    UUID_PATTERN.is_match(value)
}

/// Coerce an identifier value for the given field and collection. UUIDs
/// become the legacy binary when the field is an ID field of a binary-id
/// collection; everything else passes through as a string.
pub fn coerce_id(value: &str, field: &str, collection: &str) -> Result<Bson> {
    if is_uuid(value) && is_id_field(field, collection) && is_binary_id_collection(collection) {
        return Ok(Bson::Binary(csuuid(value)?));
    }
    Ok(Bson::String(value.to_string()))
}

/// The value for the right-hand side of a comparison. UUID strings are
/// coerced to the legacy binary only when the compared field is an ID field
/// of a binary-id collection.
pub fn comparison_value(value: &SqlValue, field: &str, collection: &str) -> Bson {
    match value {
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            if is_uuid(s) && is_id_field(field, collection) && is_binary_id_collection(collection)
            {
                match csuuid(s) {
                    Ok(bin) => Bson::Binary(bin),
                    Err(_) => Bson::String(s.clone()),
                }
            } else {
                Bson::String(s.clone())
            }
        }
        other => literal(other),
    }
}

/// Encode a canonical UUID string as the legacy 16-byte binary, subtype 3.
///
/// The first three groups are stored little-endian and the remainder
/// big-endian: `[b3 b2 b1 b0][b5 b4][b7 b6][b8..b15]`.
pub fn csuuid(raw: &str) -> Result<Binary> {
    let trimmed = raw.trim_start_matches('{').trim_end_matches('}');
    let parsed = Uuid::parse_str(trimmed).map_err(|_| Error::Uuid(raw.to_string()))?;
    let b = parsed.as_bytes();

    let mut bytes = Vec::with_capacity(16);
    bytes.extend_from_slice(&[b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6]]);
    bytes.extend_from_slice(&b[8..16]);

    Ok(Binary {
        subtype: BinarySubtype::UuidOld,
        bytes,
    })
}
