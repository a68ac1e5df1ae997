//! Records written to a sink, rendered as InfluxDB line protocol or JSON.
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```

use super::SinkError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Field values for InfluxDB line protocol
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    /// Written with an `i` suffix
    Integer(i64),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Float(num) => write!(f, "{num}"),
            FieldValue::Integer(num) => write!(f, "{num}i"),
            FieldValue::String(s) => {
                write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
            }
        }
    }
}

impl From<&FieldValue> for Value {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Float(num) => Value::from(*num),
            FieldValue::Integer(num) => Value::from(*num),
            FieldValue::String(s) => Value::from(s.as_str()),
        }
    }
}

/// Data point in InfluxDB line protocol
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub measurement: String,
    pub tag_set: BTreeMap<String, String>,
    pub field_set: BTreeMap<String, FieldValue>,
    pub timestamp: Option<SystemTime>,
}

impl DataPoint {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tag_set: BTreeMap::new(),
            field_set: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tag_set.insert(key.into(), value.into());
        self
    }

    /// Add a field. NaN and infinite floats have no line-protocol form and
    /// are left out.
    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        if let FieldValue::Float(num) = value
            && !num.is_finite()
        {
            return self;
        }
        self.field_set.insert(key.into(), value);
        self
    }

    pub fn timestamp(mut self, time: SystemTime) -> Self {
        self.timestamp = Some(time);
        self
    }

    /// Nanoseconds since the Unix epoch; instants before the epoch clamp to zero.
    pub fn timestamp_nanos(&self) -> Option<u128> {
        self.timestamp.map(|time| {
            time.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        })
    }

    /// A point needs at least one field to be written.
    pub fn check_writable(&self) -> Result<(), SinkError> {
        if self.field_set.is_empty() {
            return Err(SinkError::NoFields(self.measurement.clone()));
        }
        Ok(())
    }

    /// JSON object used as broker payload.
    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert("measurement".into(), Value::from(self.measurement.as_str()));
        let tags: Map<String, Value> = self
            .tag_set
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        object.insert("tags".into(), Value::Object(tags));
        let fields: Map<String, Value> = self
            .field_set
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v)))
            .collect();
        object.insert("fields".into(), Value::Object(fields));
        if let Some(nanos) = self.timestamp_nanos() {
            // u128 is not representable in JSON numbers; nanos fit in u64 until 2554.
            object.insert("timestamp".into(), Value::from(nanos as u64));
        }
        Value::Object(object)
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys share the same escaping rules.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn fmt_tags(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    for (key, value) in data_point.tag_set.iter() {
        write!(fmt, ",{}={}", escape_key(key), escape_key(value))?;
    }
    Ok(())
}

fn fmt_fields(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    let mut first = true;
    for (key, value) in data_point.field_set.iter() {
        if first {
            first = false;
        } else {
            write!(fmt, ",")?;
        }
        write!(fmt, "{}={}", escape_key(key), value)?;
    }
    Ok(())
}

fn fmt_timestamp(data_point: &DataPoint, fmt: &mut fmt::Formatter) -> fmt::Result {
    if let Some(nanos) = data_point.timestamp_nanos() {
        write!(fmt, " {}", nanos)?;
    }
    Ok(())
}

impl fmt::Display for DataPoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", escape_measurement(&self.measurement))?;
        fmt_tags(self, fmt)?;
        write!(fmt, " ")?;
        fmt_fields(self, fmt)?;
        fmt_timestamp(self, fmt)
    }
}
