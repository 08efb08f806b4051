use chrono::{TimeZone, Utc};
use evchain_types::{
    Correlation, EventId, EventPayload, Execution, PayloadField, Principal, Provider,
    ScrubbedEvent, SystemMetadata, TimeCreated,
};

fn sample_event() -> ScrubbedEvent {
    let payload = EventPayload(vec![
        PayloadField {
            name: Some("SubjectUserName".into()),
            value: Some("user".into()),
        },
        PayloadField {
            name: Some("SubjectDomainName".into()),
            value: Some("laptop".into()),
        },
    ]);

    ScrubbedEvent {
        system: SystemMetadata {
            provider: Provider {
                name: Some("Test-Provider".into()),
                guid: Some("{69884110-5b41-41cc-93c7-02ce8e8882f6}".parse().unwrap()),
                event_source_name: None,
            },
            event_id: 5379,
            time_created: TimeCreated {
                system_time: Utc.timestamp_opt(0, 0).unwrap(),
            },
            event_record_id: 12_743_445,
            correlation: Correlation {
                activity_id: Some("{d4c3abe3-54f8-4467-9b26-b8da06ae52b1}".parse().unwrap()),
            },
            execution: Execution {
                process_id: Some(1234),
                thread_id: Some(12005),
            },
            channel: "Security".into(),
            computer: "laptop".into(),
        },
        off_chain_hash: payload.hash_hex().unwrap(),
    }
}

#[test]
fn identical_inputs_produce_identical_event_ids() {
    let principal = Principal::new("alice").unwrap();
    let first = EventId::derive(42, &principal, &sample_event()).unwrap();
    let second = EventId::derive(42, &principal, &sample_event()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn event_id_depends_on_height_principal_and_event() {
    let alice = Principal::new("alice").unwrap();
    let bob = Principal::new("bob").unwrap();
    let event = sample_event();

    let base = EventId::derive(42, &alice, &event).unwrap();
    assert_ne!(base, EventId::derive(43, &alice, &event).unwrap());
    assert_ne!(base, EventId::derive(42, &bob, &event).unwrap());

    let mut changed = sample_event();
    changed.system.channel = "Application".into();
    assert_ne!(base, EventId::derive(42, &alice, &changed).unwrap());
}

#[test]
fn serialized_record_survives_a_round_trip_unchanged() {
    let event = sample_event();
    let json = serde_json::to_string(&event).unwrap();
    let decoded: ScrubbedEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(decoded, event);

    let principal = Principal::new("alice").unwrap();
    assert_eq!(
        EventId::derive(42, &principal, &event).unwrap(),
        EventId::derive(42, &principal, &decoded).unwrap()
    );
}
