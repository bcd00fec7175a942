//! Vital-sign record types
//!
//! Shared by the decoder, the reconciler and the poll driver. The JSON shape
//! mirrors what the display layer consumes: readings that are absent (or
//! belong to a synthetic placeholder) serialize as the `"N/A"` sentinel and
//! the delivery flag is exposed as `missedLive`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Sentinel used for readings that are absent or synthetic.
pub const READING_SENTINEL: &str = "N/A";

/// Literal `time` carried by placeholder records.
pub const RECOVERED_TIME: &str = "Recovered via fallback";

/// Capture timestamp of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTime {
    /// Real reading captured at this instant
    At(DateTime<Utc>),
    /// Synthetic placeholder, never captured
    Recovered,
}

impl CaptureTime {
    /// Parse an envelope timestamp.
    ///
    /// Accepts RFC 3339, the Postgres text form (space separator, optional
    /// `+hh` offset) and naive ISO-8601, which is taken as UTC.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw == RECOVERED_TIME {
            return Some(Self::Recovered);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(Self::At(dt.with_timezone(&Utc)));
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
            if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
                return Some(Self::At(dt.with_timezone(&Utc)));
            }
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
                return Some(Self::At(Utc.from_utc_datetime(&naive)));
            }
        }
        None
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered)
    }
}

impl Serialize for CaptureTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::At(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            Self::Recovered => serializer.serialize_str(RECOVERED_TIME),
        }
    }
}

impl<'de> Deserialize<'de> for CaptureTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid capture time: {raw}")))
    }
}

/// A single vital-sign reading, genuine or synthetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalRecord {
    pub seq_no: u64,
    pub patient_id: String,
    #[serde(with = "reading", default)]
    pub heart_rate: Option<f64>,
    #[serde(with = "reading", default)]
    pub oxygen_level: Option<f64>,
    #[serde(with = "reading", default)]
    pub temp: Option<f64>,
    pub time: CaptureTime,
    /// Origin knew delivery was delayed
    #[serde(default)]
    pub late: bool,
    /// Not observed during its live polling window
    #[serde(rename = "missedLive", default)]
    pub missed_live: bool,
}

impl VitalRecord {
    /// Synthetic record standing in for a sequence number that never arrived.
    pub fn placeholder(seq_no: u64, patient_id: &str) -> Self {
        Self {
            seq_no,
            patient_id: patient_id.to_string(),
            heart_rate: None,
            oxygen_level: None,
            temp: None,
            time: CaptureTime::Recovered,
            late: false,
            missed_live: true,
        }
    }

    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.time.is_recovered()
    }
}

/// Raw row as returned by the remote log, before decryption.
///
/// The range endpoint returns every envelope field; the "latest" endpoint
/// omits `late`, so everything except the ciphertext is optional here and
/// validated by the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_no: Option<u64>,
    #[serde(
        default,
        deserialize_with = "opt_string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub encrypted_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late: Option<bool>,
}

/// Why a reading could not be coerced to a finite number.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingFault {
    NotNumeric(String),
    NonFinite,
}

/// Coerce a loosely-typed JSON reading.
///
/// `null`, a missing value and the `"N/A"` sentinel mean "no reading".
/// Numbers and numeric strings are accepted; the result must be finite.
pub fn coerce_reading(value: Option<&Value>) -> Result<Option<f64>, ReadingFault> {
    let parsed = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ReadingFault::NotNumeric(n.to_string()))?,
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed == READING_SENTINEL {
                return Ok(None);
            }
            trimmed
                .parse::<f64>()
                .map_err(|_| ReadingFault::NotNumeric(s.clone()))?
        }
        Some(other) => return Err(ReadingFault::NotNumeric(other.to_string())),
    };

    if parsed.is_finite() {
        Ok(Some(parsed))
    } else {
        Err(ReadingFault::NonFinite)
    }
}

/// Identifier that may arrive as a JSON string or integer.
pub fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_from_value))
}

/// Serde adapter writing `None` as the `"N/A"` sentinel.
pub mod reading {
    use super::{coerce_reading, ReadingFault, READING_SENTINEL};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_f64(*v),
            None => serializer.serialize_str(READING_SENTINEL),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<Value>::deserialize(deserializer)?;
        coerce_reading(value.as_ref()).map_err(|fault| match fault {
            ReadingFault::NotNumeric(raw) => de::Error::custom(format!("not numeric: {raw}")),
            ReadingFault::NonFinite => de::Error::custom("non-finite reading"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholder_serializes_sentinels() {
        let p = VitalRecord::placeholder(3, "patient1");
        let v = serde_json::to_value(&p).unwrap();

        assert_eq!(v["seq_no"], 3);
        assert_eq!(v["heart_rate"], "N/A");
        assert_eq!(v["oxygen_level"], "N/A");
        assert_eq!(v["temp"], "N/A");
        assert_eq!(v["time"], RECOVERED_TIME);
        assert_eq!(v["late"], false);
        assert_eq!(v["missedLive"], true);
        assert!(p.is_placeholder());
    }

    #[test]
    fn test_record_json_roundtrip_keeps_sentinel_semantics() {
        let raw = json!({
            "seq_no": 7,
            "patient_id": "patient1",
            "heart_rate": 72,
            "oxygen_level": "98",
            "temp": "N/A",
            "time": "2024-05-01T12:00:00+00:00",
            "late": true
        });
        let rec: VitalRecord = serde_json::from_value(raw).unwrap();

        assert_eq!(rec.heart_rate, Some(72.0));
        assert_eq!(rec.oxygen_level, Some(98.0));
        assert_eq!(rec.temp, None);
        assert!(rec.late);
        assert!(!rec.missed_live);
        assert!(!rec.is_placeholder());
    }

    #[test]
    fn test_coerce_reading_rejects_non_finite_and_garbage() {
        assert_eq!(coerce_reading(Some(&json!("36.6"))), Ok(Some(36.6)));
        assert_eq!(coerce_reading(Some(&json!(null))), Ok(None));
        assert_eq!(coerce_reading(None), Ok(None));
        assert_eq!(coerce_reading(Some(&json!("NaN"))), Err(ReadingFault::NonFinite));
        assert_eq!(coerce_reading(Some(&json!("inf"))), Err(ReadingFault::NonFinite));
        assert!(matches!(
            coerce_reading(Some(&json!("abc"))),
            Err(ReadingFault::NotNumeric(_))
        ));
        assert!(matches!(
            coerce_reading(Some(&json!(""))),
            Err(ReadingFault::NotNumeric(_))
        ));
        assert!(matches!(
            coerce_reading(Some(&json!(true))),
            Err(ReadingFault::NotNumeric(_))
        ));
    }

    #[test]
    fn test_capture_time_formats() {
        let rfc = CaptureTime::parse("2024-05-01T12:00:00.250Z").unwrap();
        let pg = CaptureTime::parse("2024-05-01 12:00:00.25+00").unwrap();
        let naive = CaptureTime::parse("2024-05-01T12:00:00.25").unwrap();
        assert_eq!(rfc, pg);
        assert_eq!(rfc, naive);
        assert_eq!(CaptureTime::parse(RECOVERED_TIME), Some(CaptureTime::Recovered));
        assert_eq!(CaptureTime::parse("yesterday"), None);
    }

    #[test]
    fn test_raw_row_accepts_both_shapes() {
        let range: RawRow = serde_json::from_value(json!({
            "uuid": "a", "seq_no": 4, "patient_id": 1,
            "time": "2024-05-01T12:00:00Z", "encrypted_data": "xyz", "late": true
        }))
        .unwrap();
        assert_eq!(range.patient_id.as_deref(), Some("1"));
        assert_eq!(range.late, Some(true));

        let latest: RawRow = serde_json::from_value(json!({
            "encrypted_data": "xyz", "time": "2024-05-01T12:00:00Z"
        }))
        .unwrap();
        assert_eq!(latest.seq_no, None);
        assert_eq!(latest.late, None);
    }
}
