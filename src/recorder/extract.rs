//! Extractors over raw stream payloads.
//!
//! The inbound feed is schemaless beyond its dispatch keys, so the hot path
//! (`op`, `ct`, clocks) decodes only thin probe structs; everything else
//! walks the generic JSON tree.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Event coordinates for a settled market, used to derive the archive key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub event_id: String,
    /// Four-digit year of the event's open date.
    pub year: String,
    /// Three-letter English month abbreviation, e.g. `Sep`.
    pub month: String,
    /// Day of month without leading zero.
    pub day: String,
}

/// Operation kind of a frame, or empty when absent/unparseable.
pub fn extract_op(raw: &[u8]) -> String {
    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct Probe {
        op: String,
    }
    serde_json::from_slice::<Probe>(raw).map(|p| p.op).unwrap_or_default()
}

/// Change type (`SUB_IMAGE`, `HEARTBEAT`, `UPDATE`) of a frame, or empty.
pub fn extract_change_type(raw: &[u8]) -> String {
    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct Probe {
        ct: String,
    }
    serde_json::from_slice::<Probe>(raw).map(|p| p.ct).unwrap_or_default()
}

/// Resume tokens carried by a frame; either may be empty.
pub fn extract_clocks(raw: &[u8]) -> (String, String) {
    #[derive(Default, Deserialize)]
    #[serde(default)]
    struct Probe {
        #[serde(rename = "initialClk")]
        initial_clk: String,
        clk: String,
    }
    serde_json::from_slice::<Probe>(raw)
        .map(|p| (p.initial_clk, p.clk))
        .unwrap_or_default()
}

/// Market id of a single market-change entry.
pub fn market_change_id(change: &Value) -> Option<&str> {
    change.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())
}

/// Market status carried by a market-change entry's definition, if any.
pub fn market_change_status(change: &Value) -> Option<&str> {
    change
        .get("marketDefinition")
        .and_then(|def| def.get("status"))
        .and_then(Value::as_str)
        .filter(|status| !status.is_empty())
}

pub fn is_market_settled(status: &str) -> bool {
    status == "CLOSED"
}

/// Remove the top-level request-correlation `id` field, if present.
pub fn strip_request_id(value: &mut Value) {
    if let Some(object) = value.as_object_mut() {
        object.remove("id");
    }
}

/// Extract the event id and open-date coordinates from a single-market
/// frame's `mc[0].marketDefinition`.
pub fn extract_event_info(frame: &Value) -> Result<EventInfo> {
    let definition = frame
        .get("mc")
        .and_then(Value::as_array)
        .and_then(|mc| mc.first())
        .and_then(|change| change.get("marketDefinition"));

    let event_id = definition
        .and_then(|def| def.get("eventId"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if event_id.is_empty() {
        bail!("no event information found");
    }

    let open_date = definition
        .and_then(|def| def.get("openDate"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let date: DateTime<Utc> = open_date
        .parse()
        .map_err(|e| anyhow::anyhow!("parse openDate {open_date:?}: {e}"))?;

    Ok(EventInfo {
        event_id: event_id.to_string(),
        year: date.year().to_string(),
        month: date.format("%b").to_string(),
        day: date.day().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_op() {
        assert_eq!(extract_op(br#"{"op":"mcm","id":3}"#), "mcm");
        assert_eq!(extract_op(br#"{"op":"status","statusCode":"SUCCESS"}"#), "status");
        assert_eq!(extract_op(br#"{invalid}"#), "");
        assert_eq!(extract_op(br#"{"id":3}"#), "");
    }

    #[test]
    fn test_extract_change_type() {
        assert_eq!(extract_change_type(br#"{"op":"mcm","ct":"HEARTBEAT"}"#), "HEARTBEAT");
        assert_eq!(extract_change_type(br#"{"op":"mcm","ct":"SUB_IMAGE"}"#), "SUB_IMAGE");
        assert_eq!(extract_change_type(br#"{"op":"mcm"}"#), "");
        assert_eq!(extract_change_type(br#"{invalid}"#), "");
    }

    #[test]
    fn test_extract_clocks() {
        assert_eq!(
            extract_clocks(br#"{"initialClk":"init123","clk":"clk456"}"#),
            ("init123".to_string(), "clk456".to_string())
        );
        assert_eq!(
            extract_clocks(br#"{"initialClk":"init123"}"#),
            ("init123".to_string(), String::new())
        );
        assert_eq!(
            extract_clocks(br#"{"clk":"clk456"}"#),
            (String::new(), "clk456".to_string())
        );
        assert_eq!(extract_clocks(br#"{"op":"mcm"}"#), (String::new(), String::new()));
    }

    #[test]
    fn test_market_change_accessors() {
        let change = json!({"id": "1.248231892", "marketDefinition": {"status": "OPEN"}});
        assert_eq!(market_change_id(&change), Some("1.248231892"));
        assert_eq!(market_change_status(&change), Some("OPEN"));

        let no_definition = json!({"id": "1.1", "rc": []});
        assert_eq!(market_change_status(&no_definition), None);

        let empty_id = json!({"id": ""});
        assert_eq!(market_change_id(&empty_id), None);
    }

    #[test]
    fn test_is_market_settled() {
        assert!(is_market_settled("CLOSED"));
        assert!(!is_market_settled("OPEN"));
        assert!(!is_market_settled("SUSPENDED"));
        assert!(!is_market_settled(""));
    }

    #[test]
    fn test_strip_request_id_roundtrip() {
        let original = json!({"op": "mcm", "id": 2, "pt": 1, "mc": []});
        let mut stripped = original.clone();
        strip_request_id(&mut stripped);
        assert!(stripped.get("id").is_none());
        assert_eq!(stripped["op"], "mcm");

        // Re-adding the field restores the original object.
        stripped["id"] = json!(2);
        assert_eq!(stripped, original);
    }

    #[test]
    fn test_strip_request_id_without_field() {
        let mut value = json!({"op": "mcm"});
        strip_request_id(&mut value);
        assert_eq!(value, json!({"op": "mcm"}));
    }

    #[test]
    fn test_extract_event_info() {
        let frame = json!({
            "op": "mcm",
            "mc": [{
                "id": "1.T",
                "marketDefinition": {
                    "eventId": "E",
                    "openDate": "2025-09-26T00:40:00.000Z",
                    "status": "CLOSED",
                }
            }]
        });

        let info = extract_event_info(&frame).unwrap();
        assert_eq!(info.event_id, "E");
        assert_eq!(info.year, "2025");
        assert_eq!(info.month, "Sep");
        assert_eq!(info.day, "26");
    }

    #[test]
    fn test_extract_event_info_single_digit_day() {
        let frame = json!({
            "mc": [{"marketDefinition": {"eventId": "34141864", "openDate": "2024-01-03T09:05:00.000Z"}}]
        });
        let info = extract_event_info(&frame).unwrap();
        assert_eq!(info.month, "Jan");
        assert_eq!(info.day, "3");
    }

    #[test]
    fn test_extract_event_info_missing_event() {
        let frame = json!({"mc": [{"marketDefinition": {"status": "CLOSED"}}]});
        assert!(extract_event_info(&frame).is_err());

        let empty = json!({"mc": []});
        assert!(extract_event_info(&empty).is_err());
    }
}
