//! Request and response shapes for the betting API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market selection predicates, shared by the catalogue request and the
/// stream subscription (the stream message uses its own key spelling, see
/// `stream::client::build_subscription_message`).
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketFilter {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub market_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub event_type_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub market_countries: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub market_type_codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketProjection {
    Competition,
    Event,
    EventType,
    MarketStartTime,
    MarketDescription,
    RunnerDescription,
    RunnerMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketSort {
    MinimumTraded,
    MaximumTraded,
    MinimumAvailable,
    MaximumAvailable,
    FirstToStart,
    LastToStart,
}

/// Catalogue metadata for one market, as returned by `listMarketCatalogue`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarketCatalogue {
    pub market_id: String,
    pub market_name: String,
    pub market_start_time: Option<DateTime<Utc>>,
    pub description: Option<MarketDescription>,
    pub total_matched: f64,
    pub runners: Vec<RunnerCatalog>,
    pub event_type: Option<EventType>,
    pub competition: Option<Competition>,
    pub event: Option<Event>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarketDescription {
    pub persistence_enabled: bool,
    pub bsp_market: bool,
    pub market_time: Option<DateTime<Utc>>,
    pub suspend_time: Option<DateTime<Utc>>,
    pub betting_type: String,
    pub turn_in_play_enabled: bool,
    pub market_type: String,
    pub regulator: String,
    pub race_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerCatalog {
    pub selection_id: i64,
    pub runner_name: String,
    pub handicap: f64,
    pub sort_priority: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventType {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Competition {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub country_code: String,
    pub timezone: String,
    pub venue: String,
    pub open_date: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_filter_skips_empty_fields() {
        let filter = MarketFilter {
            market_ids: vec!["1.234".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, serde_json::json!({"marketIds": ["1.234"]}));
    }

    #[test]
    fn test_projection_wire_names() {
        assert_eq!(
            serde_json::to_value(MarketProjection::RunnerDescription).unwrap(),
            "RUNNER_DESCRIPTION"
        );
        assert_eq!(
            serde_json::to_value(MarketSort::FirstToStart).unwrap(),
            "FIRST_TO_START"
        );
    }

    #[test]
    fn test_catalogue_decodes_partial_payload() {
        let cat: MarketCatalogue = serde_json::from_str(
            r#"{
                "marketId": "1.248231892",
                "marketName": "Win",
                "event": {"id": "34141864", "name": "Healesville R1", "venue": "Healesville"},
                "runners": [{"selectionId": 1, "runnerName": "Fantastic Nadia", "sortPriority": 1}]
            }"#,
        )
        .unwrap();

        assert_eq!(cat.market_name, "Win");
        assert_eq!(cat.event.as_ref().unwrap().venue, "Healesville");
        assert_eq!(cat.runners[0].selection_id, 1);
        assert_eq!(cat.runners[0].handicap, 0.0);
        assert!(cat.competition.is_none());
    }
}
