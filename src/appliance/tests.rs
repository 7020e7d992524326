use super::*;
use chrono::Duration;

#[test]
fn test_parse_valid_key() {
    let key = ApplianceKey::parse("default", "kitchen1").unwrap();
    assert_eq!(key.namespace, "default");
    assert_eq!(key.name, "kitchen1");
    assert_eq!(key.to_string(), "default/kitchen1");
}

#[test]
fn test_parse_rejects_empty_segments() {
    assert_eq!(
        ApplianceKey::parse("", "kitchen1"),
        Err(KeyError::Empty("namespace"))
    );
    assert_eq!(
        ApplianceKey::parse("default", ""),
        Err(KeyError::Empty("name"))
    );
}

#[test]
fn test_parse_rejects_topic_separators_and_wildcards() {
    for bad in ["a/b", "kitchen+", "all#", "Kitchen", "a.b"] {
        let result = ApplianceKey::parse("default", bad);
        assert!(
            matches!(result, Err(KeyError::InvalidCharacter { field: "name", .. })),
            "expected {bad} to be rejected"
        );
    }
}

#[test]
fn test_parse_rejects_long_segment() {
    let long_name = "a".repeat(MAX_SEGMENT_LEN + 1);
    assert_eq!(
        ApplianceKey::parse("default", &long_name),
        Err(KeyError::TooLong("name"))
    );
    assert!(ApplianceKey::parse("default", &"a".repeat(MAX_SEGMENT_LEN)).is_ok());
}

#[test]
fn test_new_appliance_starts_unreconciled() {
    let appliance = Appliance::new(
        ApplianceKey::new("default", "kitchen1"),
        ApplianceSpec { power: true },
    );
    assert_eq!(appliance.generation, 1);
    assert_eq!(appliance.resource_version, 1);
    assert!(!appliance.status.observed_power);
    assert!(appliance.powered_on().is_none());
}

#[test]
fn test_appliance_json_shape() {
    let mut appliance = Appliance::new(
        ApplianceKey::new("default", "kitchen1"),
        ApplianceSpec { power: true },
    );
    appliance.status.observed_power = true;
    set_status_condition(
        &mut appliance.status.conditions,
        Condition::new(CONDITION_POWERED_ON, ConditionStatus::True, REASON_UPDATED, "on"),
    );

    let json = serde_json::to_value(&appliance).unwrap();
    assert_eq!(json["namespace"], "default");
    assert_eq!(json["name"], "kitchen1");
    assert_eq!(json["spec"]["power"], true);
    assert_eq!(json["status"]["observedPower"], true);
    assert_eq!(json["status"]["conditions"][0]["type"], "poweredOn");
    assert_eq!(json["status"]["conditions"][0]["status"], "True");

    let back: Appliance = serde_json::from_value(json).unwrap();
    assert_eq!(back, appliance);
}

#[test]
fn test_set_condition_appends_new_type() {
    let mut conditions = Vec::new();
    let changed = set_status_condition(
        &mut conditions,
        Condition::new("poweredOn", ConditionStatus::True, "Updated", "on"),
    );
    assert!(changed);

    set_status_condition(
        &mut conditions,
        Condition::new("reachable", ConditionStatus::Unknown, "Pending", "waiting"),
    );
    assert_eq!(conditions.len(), 2);
    assert_eq!(conditions[1].type_, "reachable");
}

#[test]
fn test_set_condition_replaces_same_type() {
    let mut conditions = vec![Condition::new(
        "poweredOn",
        ConditionStatus::True,
        "Updated",
        "Appliance kitchen1 is powered true",
    )];

    let changed = set_status_condition(
        &mut conditions,
        Condition::new(
            "poweredOn",
            ConditionStatus::False,
            "Updated",
            "Appliance kitchen1 is powered false",
        ),
    );

    assert!(changed);
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].status, ConditionStatus::False);
    assert_eq!(conditions[0].message, "Appliance kitchen1 is powered false");
}

#[test]
fn test_transition_time_only_moves_on_status_change() {
    let mut original = Condition::new("poweredOn", ConditionStatus::True, "Updated", "on");
    original.last_transition_time = Utc::now() - Duration::hours(1);
    let first_transition = original.last_transition_time;
    let mut conditions = vec![original];

    // Same status: timestamp and record unchanged
    let changed = set_status_condition(
        &mut conditions,
        Condition::new("poweredOn", ConditionStatus::True, "Updated", "on"),
    );
    assert!(!changed);
    assert_eq!(conditions[0].last_transition_time, first_transition);

    // Status flips: timestamp moves
    set_status_condition(
        &mut conditions,
        Condition::new("poweredOn", ConditionStatus::False, "Updated", "off"),
    );
    assert!(conditions[0].last_transition_time > first_transition);
}

#[test]
fn test_condition_status_from_bool() {
    assert_eq!(ConditionStatus::from(true), ConditionStatus::True);
    assert_eq!(ConditionStatus::from(false), ConditionStatus::False);
}
