//! Conversions between source documents and destination JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bson::{Bson, Document};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

/// Formats a BSON date as RFC 3339 in UTC with millisecond precision.
pub fn datetime_to_rfc3339(dt: &bson::DateTime) -> String {
    match Utc.timestamp_millis_opt(dt.timestamp_millis()).single() {
        Some(ts) => ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => dt.to_string(),
    }
}

/// Converts a document into the JSON body stored in the destination.
pub fn to_json(doc: &Document) -> Value {
    Value::Object(
        doc.iter()
            .map(|(k, v)| (k.clone(), bson_to_json(v)))
            .collect::<Map<String, Value>>(),
    )
}

/// Converts a single value.
///
/// Types without a JSON counterpart are flattened to strings; the rest use
/// relaxed extended JSON.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Document(doc) => to_json(doc),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(datetime_to_rfc3339(dt)),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Binary(bin) => Value::String(STANDARD.encode(&bin.bytes)),
        Bson::Undefined => Value::Null,
        other => other.clone().into_relaxed_extjson(),
    }
}
