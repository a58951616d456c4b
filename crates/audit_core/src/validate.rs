//! Structural checks on proposed rollback values, per entity kind.
//!
//! These guard the write path only — general CRUD validation of the
//! audited entities lives with their owners, not here.

use chrono::NaiveDate;

use crate::types::{EntityKind, StateMap};

/// Pricing models the billing engine understands.
pub const VALID_PRICING_MODELS: [&str; 5] = [
    "fixed",
    "consumption_based",
    "tiered",
    "hybrid",
    "custom_formula",
];

/// Validate the values a rollback would restore. Returns one reason per
/// violated check; empty means structurally sound.
pub fn validate_proposed_state(kind: EntityKind, values: &StateMap) -> Vec<String> {
    match kind {
        EntityKind::UtilityService => validate_utility_service(values),
        EntityKind::ServiceConfiguration => validate_service_configuration(values),
    }
}

fn validate_utility_service(values: &StateMap) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(model) = values.get("pricing_model") {
        let valid = model
            .as_str()
            .map(|m| VALID_PRICING_MODELS.contains(&m))
            .unwrap_or(false);
        if !valid {
            errors.push("Invalid pricing model in rollback values".into());
        }
    }

    if let Some(formula) = values.get("calculation_formula") {
        if !formula.is_null() && !formula.is_string() {
            errors.push("Calculation formula must be a string".into());
        }
    }

    errors
}

fn validate_service_configuration(values: &StateMap) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(schedule) = values.get("rate_schedule") {
        if !schedule.is_null() && !schedule.is_object() && !schedule.is_array() {
            errors.push("Rate schedule must be structured data or null".into());
        }
    }

    if let Some(effective_from) = values.get("effective_from") {
        if !effective_from.is_null() && !parses_as_date(effective_from) {
            errors.push("Invalid effective_from date format".into());
        }
    }

    errors
}

fn parses_as_date(value: &serde_json::Value) -> bool {
    let Some(s) = value.as_str() else {
        return false;
    };
    s.parse::<chrono::DateTime<chrono::Utc>>().is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, serde_json::Value)]) -> StateMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn known_pricing_models_pass() {
        for model in VALID_PRICING_MODELS {
            let values = state(&[("pricing_model", json!(model))]);
            assert!(validate_proposed_state(EntityKind::UtilityService, &values).is_empty());
        }
    }

    #[test]
    fn unknown_pricing_model_is_rejected() {
        let values = state(&[("pricing_model", json!("per_seat"))]);
        let errors = validate_proposed_state(EntityKind::UtilityService, &values);
        assert_eq!(errors, vec!["Invalid pricing model in rollback values"]);
    }

    #[test]
    fn non_string_formula_is_rejected() {
        let values = state(&[("calculation_formula", json!(42))]);
        let errors = validate_proposed_state(EntityKind::UtilityService, &values);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn rate_schedule_accepts_object_array_or_null() {
        for schedule in [json!({"tier1": 0.2}), json!([1, 2]), json!(null)] {
            let values = state(&[("rate_schedule", schedule)]);
            assert!(validate_proposed_state(EntityKind::ServiceConfiguration, &values).is_empty());
        }
    }

    #[test]
    fn scalar_rate_schedule_is_rejected() {
        let values = state(&[("rate_schedule", json!("flat"))]);
        let errors = validate_proposed_state(EntityKind::ServiceConfiguration, &values);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn effective_from_date_formats() {
        let ok = state(&[("effective_from", json!("2026-02-01"))]);
        assert!(validate_proposed_state(EntityKind::ServiceConfiguration, &ok).is_empty());

        let ok_ts = state(&[("effective_from", json!("2026-02-01T10:00:00Z"))]);
        assert!(validate_proposed_state(EntityKind::ServiceConfiguration, &ok_ts).is_empty());

        let bad = state(&[("effective_from", json!("February 1st"))]);
        assert_eq!(
            validate_proposed_state(EntityKind::ServiceConfiguration, &bad).len(),
            1
        );
    }

    #[test]
    fn fields_absent_means_no_errors() {
        assert!(validate_proposed_state(EntityKind::UtilityService, &StateMap::new()).is_empty());
        assert!(
            validate_proposed_state(EntityKind::ServiceConfiguration, &StateMap::new()).is_empty()
        );
    }
}
