//! Catalogue enrichment of single-market payloads.
//!
//! The stream's `marketDefinition` carries no human-readable names; those
//! live in the REST catalogue. Enrichment merges them in before the line is
//! written. A payload whose shape doesn't match is left untouched; the
//! non-enriched line is always preferred over dropping data.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::rest::{MarketCatalogue, RunnerCatalog};

/// Merge catalogue metadata into `payload`'s `mc[0].marketDefinition`.
pub fn enrich_payload(catalogue: &MarketCatalogue, payload: &mut Value) {
    let Some(definition) = payload
        .get_mut("mc")
        .and_then(Value::as_array_mut)
        .and_then(|mc| mc.first_mut())
        .and_then(|change| change.get_mut("marketDefinition"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    definition.insert("marketName".to_string(), json!(catalogue.market_name));
    if let Some(event) = &catalogue.event {
        definition.insert("eventName".to_string(), json!(event.name));
        if !event.venue.is_empty() {
            definition.insert("venue".to_string(), json!(event.venue));
        }
    }
    if let Some(event_type) = &catalogue.event_type {
        definition.insert("eventTypeName".to_string(), json!(event_type.name));
    }
    if let Some(competition) = &catalogue.competition {
        definition.insert("competitionName".to_string(), json!(competition.name));
    }

    let Some(runners) = definition.get_mut("runners").and_then(Value::as_array_mut) else {
        return;
    };

    let by_selection: HashMap<i64, &RunnerCatalog> = catalogue
        .runners
        .iter()
        .map(|runner| (runner.selection_id, runner))
        .collect();

    for runner in runners {
        let Some(runner) = runner.as_object_mut() else {
            continue;
        };
        let Some(selection_id) = runner.get("id").and_then(Value::as_i64) else {
            continue;
        };
        let Some(catalogue_runner) = by_selection.get(&selection_id) else {
            continue;
        };

        if !runner.contains_key("adjustmentFactor") {
            runner.insert("adjustmentFactor".to_string(), json!(0.0));
        }
        runner.insert("name".to_string(), json!(catalogue_runner.runner_name));
        if catalogue_runner.handicap != 0.0 {
            runner.insert("handicap".to_string(), json!(catalogue_runner.handicap));
        }
        runner.insert("sortPriority".to_string(), json!(catalogue_runner.sort_priority));
    }
}
