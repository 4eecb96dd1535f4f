// ironlinq-core/src/codec.rs
//! Leaf scalar codec
//!
//! Scalars travel as relaxed Extended JSON on top of `serde_json::Value`:
//!
//! - date/time: `{"$date": <milliseconds since epoch>}`
//! - object identifier: `{"$oid": "<24 hex chars>"}`
//! - duration: plain number of seconds
//!
//! The translator only needs to build these values and the reference store only needs
//! to read them back; typed result structs use the `date` / `duration` serde modules.

use crate::error::{LinqError, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

pub const DATE_KEY: &str = "$date";
pub const OID_KEY: &str = "$oid";

/// Durations are stored in seconds; dates add and subtract in milliseconds
pub const MILLIS_PER_DURATION_UNIT: f64 = 1000.0;

pub const MILLIS_PER_DAY: i64 = 86_400_000;

// ============================================================================
// DATES
// ============================================================================

pub fn date_to_value(dt: &DateTime<Utc>) -> Value {
    json!({ "$date": dt.timestamp_millis() })
}

pub fn millis_to_value(millis: i64) -> Value {
    json!({ "$date": millis })
}

/// Milliseconds since epoch of an Extended JSON date (numeric or ISO-8601 payload)
pub fn date_millis(value: &Value) -> Option<i64> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    match obj.get(DATE_KEY)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

pub fn is_date(value: &Value) -> bool {
    date_millis(value).is_some()
}

pub fn value_to_date(value: &Value) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(date_millis(value)?).single()
}

// ============================================================================
// DURATIONS
// ============================================================================

pub fn duration_to_value(duration: &Duration) -> Value {
    json!(duration.num_milliseconds() as f64 / MILLIS_PER_DURATION_UNIT)
}

pub fn value_to_duration(value: &Value) -> Option<Duration> {
    let seconds = value.as_f64()?;
    Some(Duration::milliseconds(
        (seconds * MILLIS_PER_DURATION_UNIT).round() as i64,
    ))
}

// ============================================================================
// OBJECT IDS
// ============================================================================

static OID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// 12-byte identifier: 4-byte big-endian creation seconds, then 8 bytes of entropy/counter.
///
/// Byte order equals hex-string order, so identifiers sort by creation time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let now = Utc::now();
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&Self::clamp_seconds(now.timestamp()).to_be_bytes());
        bytes[4..8].copy_from_slice(&now.timestamp_subsec_nanos().to_be_bytes());
        bytes[8..].copy_from_slice(&OID_COUNTER.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    pub fn parse_str(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| LinqError::Codec(format!("Invalid ObjectId '{}': {}", s, e)))?;
        let bytes: [u8; 12] = raw.try_into().map_err(|_| {
            LinqError::Codec(format!("Invalid ObjectId '{}': expected 12 bytes", s))
        })?;
        Ok(ObjectId(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn timestamp_seconds(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.timestamp_seconds() as i64, 0)
            .single()
            .unwrap_or_default()
    }

    /// Smallest identifier that could have been minted during the second containing `dt`
    pub fn min_for(dt: &DateTime<Utc>) -> Self {
        Self::bounded(dt, 0x00)
    }

    /// Largest identifier that could have been minted during the second containing `dt`
    pub fn max_for(dt: &DateTime<Utc>) -> Self {
        Self::bounded(dt, 0xff)
    }

    fn bounded(dt: &DateTime<Utc>, fill: u8) -> Self {
        let mut bytes = [fill; 12];
        bytes[..4].copy_from_slice(&Self::clamp_seconds(dt.timestamp()).to_be_bytes());
        ObjectId(bytes)
    }

    fn clamp_seconds(secs: i64) -> u32 {
        secs.clamp(0, u32::MAX as i64) as u32
    }

    pub fn to_value(&self) -> Value {
        json!({ "$oid": self.to_hex() })
    }

    /// Accepts both `{"$oid": "..."}` and a bare hex string
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Object(obj) if obj.len() == 1 => {
                Self::parse_str(obj.get(OID_KEY)?.as_str()?).ok()
            }
            Value::String(s) => Self::parse_str(s).ok(),
            _ => None,
        }
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = LinqError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

/// Returns the hex payload if `value` is an Extended JSON object id
pub fn oid_hex(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(OID_KEY)?.as_str()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OidRepr {
    Extended {
        #[serde(rename = "$oid")]
        oid: String,
    },
    Plain(String),
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(OID_KEY, &self.to_hex())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = match OidRepr::deserialize(deserializer)? {
            OidRepr::Extended { oid } => oid,
            OidRepr::Plain(s) => s,
        };
        ObjectId::parse_str(&hex).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SERDE HELPERS FOR RESULT STRUCTS
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum DatePayload {
    Millis(i64),
    Iso(String),
}

#[derive(Deserialize)]
struct DateRepr {
    #[serde(rename = "$date")]
    date: DatePayload,
}

/// `#[serde(with = "ironlinq_core::codec::date")]` for `DateTime<Utc>` fields
pub mod date {
    use super::*;

    pub fn serialize<S: Serializer>(
        dt: &DateTime<Utc>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        date_to_value(dt).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<DateTime<Utc>, D::Error> {
        let repr = DateRepr::deserialize(deserializer)?;
        match repr.date {
            DatePayload::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| serde::de::Error::custom("date out of range")),
            DatePayload::Iso(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// `#[serde(with = "ironlinq_core::codec::duration")]` for `chrono::Duration` fields
pub mod duration {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.num_milliseconds() as f64 / MILLIS_PER_DURATION_UNIT)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        Ok(Duration::milliseconds(
            (seconds * MILLIS_PER_DURATION_UNIT).round() as i64,
        ))
    }
}
