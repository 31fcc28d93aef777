//! Wire timestamps are informational. RFC 3339 strings and epoch
//! milliseconds are understood; anything else reads as absent rather than
//! failing the frame that carries it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

pub(crate) fn parse(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(millis) => millis
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    }
}

pub(crate) fn lenient<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(default, deserialize_with = "super::lenient")]
        at: Option<DateTime<Utc>>,
    }

    fn at(raw: &str) -> Option<String> {
        let holder: Holder = serde_json::from_str(raw).unwrap();
        holder.at.map(|ts| ts.to_rfc3339())
    }

    #[test]
    fn understands_rfc3339_and_epoch_millis() {
        assert_eq!(
            at(r#"{"at":"2024-05-01T13:30:00+03:30"}"#).as_deref(),
            Some("2024-05-01T10:00:00+00:00")
        );
        assert_eq!(
            at(r#"{"at":1714557600000}"#).as_deref(),
            Some("2024-05-01T10:00:00+00:00")
        );
    }

    #[test]
    fn odd_values_read_as_absent() {
        assert_eq!(at(r#"{"at":"yesterday"}"#), None);
        assert_eq!(at(r#"{"at":{"seconds":5}}"#), None);
        assert_eq!(at(r#"{"at":null}"#), None);
        assert_eq!(at("{}"), None);
        assert!(parse(&json!(1.5)).is_none());
    }
}
