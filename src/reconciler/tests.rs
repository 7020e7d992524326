use super::*;
use crate::appliance::ApplianceSpec;
use crate::store::MemoryStore;
use crate::transport::{LoopbackTransport, QoS};
use std::time::Duration;

struct Fixture {
    store: Arc<MemoryStore>,
    transport: Arc<LoopbackTransport>,
    reconciler: Reconciler,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(LoopbackTransport::new(false));
    let reconciler = Reconciler::new(
        store.clone(),
        transport.clone(),
        TopicLayout::default(),
        PublishOptions {
            qos: QoS::AtLeastOnce,
            retain: false,
            ack_timeout: Duration::from_millis(50),
        },
    );
    Fixture {
        store,
        transport,
        reconciler,
    }
}

fn kitchen1() -> ApplianceKey {
    ApplianceKey::new("default", "kitchen1")
}

#[tokio::test]
async fn test_reconcile_publishes_and_records_status() {
    let f = fixture();
    f.store.apply(&kitchen1(), ApplianceSpec { power: true }).await.unwrap();

    let outcome = f.reconciler.reconcile(&kitchen1()).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Reconciled { observed_power: true });

    let published = f.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "home/kitchen/coffee/kitchen1/power");
    assert_eq!(published[0].payload, Bytes::from_static(b"true"));
    assert_eq!(published[0].qos, QoS::AtLeastOnce);
    assert!(!published[0].retain);

    let stored = f.store.get(&kitchen1()).await.unwrap();
    assert!(stored.status.observed_power);
    assert_eq!(stored.status.observed_generation, 1);
    assert_eq!(stored.status.conditions.len(), 1);

    let condition = stored.powered_on().unwrap();
    assert_eq!(condition.status, ConditionStatus::True);
    assert_eq!(condition.reason, "Updated");
    assert_eq!(condition.message, "Appliance kitchen1 is powered true");
}

#[tokio::test]
async fn test_reconcile_power_off_sets_false_condition() {
    let f = fixture();
    f.store.apply(&kitchen1(), ApplianceSpec { power: true }).await.unwrap();
    f.reconciler.reconcile(&kitchen1()).await.unwrap();

    f.store.apply(&kitchen1(), ApplianceSpec { power: false }).await.unwrap();
    let outcome = f.reconciler.reconcile(&kitchen1()).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Reconciled { observed_power: false });

    let stored = f.store.get(&kitchen1()).await.unwrap();
    assert!(!stored.status.observed_power);
    assert_eq!(stored.status.observed_generation, 2);
    assert_eq!(stored.status.conditions.len(), 1);
    assert_eq!(stored.powered_on().unwrap().status, ConditionStatus::False);
    assert_eq!(
        stored.powered_on().unwrap().message,
        "Appliance kitchen1 is powered false"
    );
    assert_eq!(f.transport.published()[1].payload, Bytes::from_static(b"false"));
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let f = fixture();
    f.store.apply(&kitchen1(), ApplianceSpec { power: true }).await.unwrap();

    f.reconciler.reconcile(&kitchen1()).await.unwrap();
    let first = f.store.get(&kitchen1()).await.unwrap();

    f.reconciler.reconcile(&kitchen1()).await.unwrap();
    let second = f.store.get(&kitchen1()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(f.transport.published().len(), 2);
}

#[tokio::test]
async fn test_reconcile_unknown_key_does_nothing() {
    let f = fixture();

    let outcome = f.reconciler.reconcile(&kitchen1()).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::NotFound);
    assert!(f.transport.published().is_empty());
    assert!(f.store.is_empty());
}

#[tokio::test]
async fn test_reconcile_while_disconnected_is_retryable() {
    let f = fixture();
    let before = f.store.apply(&kitchen1(), ApplianceSpec { power: true }).await.unwrap();
    f.transport.set_connected(false);

    let err = f.reconciler.reconcile(&kitchen1()).await.unwrap_err();

    assert_eq!(err, ReconcileError::TransportUnavailable);
    assert!(f.transport.published().is_empty());
    assert_eq!(f.store.get(&kitchen1()).await.unwrap(), before);
}

#[tokio::test]
async fn test_ack_timeout_leaves_status_untouched() {
    let f = fixture();
    let before = f.store.apply(&kitchen1(), ApplianceSpec { power: true }).await.unwrap();
    f.transport.set_ack_delay(Some(Duration::from_secs(10)));

    let err = f.reconciler.reconcile(&kitchen1()).await.unwrap_err();

    assert_eq!(
        err,
        ReconcileError::Publish(TransportError::AckTimeout(Duration::from_millis(50)))
    );
    assert_eq!(f.store.get(&kitchen1()).await.unwrap(), before);
}

#[tokio::test]
async fn test_publish_error_leaves_status_untouched() {
    let f = fixture();
    let before = f.store.apply(&kitchen1(), ApplianceSpec { power: true }).await.unwrap();
    f.transport
        .fail_next_publish(TransportError::Publish("broker rejected".to_string()));

    let err = f.reconciler.reconcile(&kitchen1()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Publish(_)));
    assert_eq!(f.store.get(&kitchen1()).await.unwrap(), before);
}

#[tokio::test]
async fn test_connection_lost_during_publish_maps_to_unavailable() {
    let f = fixture();
    f.store.apply(&kitchen1(), ApplianceSpec { power: true }).await.unwrap();
    f.transport.fail_next_publish(TransportError::Closed);

    let err = f.reconciler.reconcile(&kitchen1()).await.unwrap_err();
    assert_eq!(err, ReconcileError::TransportUnavailable);
}

#[test]
fn test_encode_power() {
    assert_eq!(encode_power(true), Bytes::from_static(b"true"));
    assert_eq!(encode_power(false), Bytes::from_static(b"false"));
}

#[tokio::test]
async fn test_foreign_namespace_is_not_published() {
    let f = fixture();
    let default = kitchen1();
    let garage = ApplianceKey::new("garage", "kitchen1");
    f.store.apply(&default, ApplianceSpec { power: false }).await.unwrap();
    let before = f.store.apply(&garage, ApplianceSpec { power: true }).await.unwrap();

    f.reconciler.reconcile(&default).await.unwrap();
    let err = f.reconciler.reconcile(&garage).await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::Unaddressable(TopicError::ForeignNamespace { .. })
    ));
    assert!(!err.is_retryable());

    // Only default/kitchen1 reached its device topic
    let published = f.transport.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, Bytes::from_static(b"false"));
    assert_eq!(f.store.get(&garage).await.unwrap(), before);
}

#[tokio::test]
async fn test_namespaced_topics_keep_namespaces_apart() {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(LoopbackTransport::new(false));
    let reconciler = Reconciler::new(
        store.clone(),
        transport.clone(),
        TopicLayout {
            namespaced: true,
            ..TopicLayout::default()
        },
        PublishOptions {
            qos: QoS::AtLeastOnce,
            retain: false,
            ack_timeout: Duration::from_millis(50),
        },
    );
    let garage = ApplianceKey::new("garage", "kitchen1");
    store.apply(&kitchen1(), ApplianceSpec { power: false }).await.unwrap();
    store.apply(&garage, ApplianceSpec { power: true }).await.unwrap();

    reconciler.reconcile(&kitchen1()).await.unwrap();
    reconciler.reconcile(&garage).await.unwrap();

    let topics: Vec<String> = transport.published().into_iter().map(|m| m.topic).collect();
    assert_eq!(
        topics,
        vec![
            "home/kitchen/coffee/default/kitchen1/power".to_string(),
            "home/kitchen/coffee/garage/kitchen1/power".to_string(),
        ]
    );
}
