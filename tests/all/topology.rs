use crate::helpers::{orders_topology, MockBroker};
use hutch::amqp::configuration::BrokerSettings;
use hutch::{Broker, BrokerError, Operation, Topology};

#[tokio::test]
async fn topology_is_declared_exchanges_first_then_queues_then_bindings() {
    let mock = MockBroker::new();
    // Listed in an order that would fail if applied as written.
    let topology = Topology::default()
        .bind("orders.high", "orders", "high")
        .queue("orders.high", false)
        .exchange("orders", "direct", false);

    Broker::builder(mock.clone())
        .topology(topology)
        .build()
        .await
        .unwrap();

    assert_eq!(
        mock.declarations(),
        vec!["exchange:orders", "queue:orders.high", "bind:orders.high:orders:high"]
    );
}

#[tokio::test]
async fn a_failing_topology_aborts_construction_and_closes_the_connection() {
    let mock = MockBroker::new();
    let topology = orders_topology().bind("missing", "orders", "low");

    let error = Broker::builder(mock.clone())
        .topology(topology)
        .build()
        .await
        .err()
        .expect("Building the broker should have failed");

    assert!(matches!(
        error,
        BrokerError::Operation {
            operation: Operation::BindQueue,
            ..
        }
    ));
    assert_eq!(mock.open_connections(), 0);
}

#[tokio::test]
async fn the_first_failure_stops_the_bootstrap() {
    let mock = MockBroker::new();
    let topology = Topology::default()
        .exchange("orders", "", false)
        .queue("orders.high", false);

    let error = Broker::builder(mock.clone())
        .topology(topology)
        .build()
        .await
        .err()
        .expect("Building the broker should have failed");

    assert_eq!(error.failed_operation(), Some(Operation::CreateExchange));
    assert!(!mock.has_queue("orders.high"));
}

#[tokio::test]
async fn applying_the_same_topology_twice_is_a_no_op() {
    let mock = MockBroker::new();
    let broker = Broker::builder(mock.clone())
        .topology(orders_topology())
        .build()
        .await
        .unwrap();

    orders_topology().apply(&broker).await.unwrap();

    assert!(mock.has_binding("orders.high", "orders", "high"));
}

#[tokio::test]
async fn topology_can_come_from_the_settings() {
    let mock = MockBroker::new();
    let settings: BrokerSettings = serde_json::from_value(serde_json::json!({
        "host": "localhost",
        "port": 5672,
        "username": "guest",
        "password": "guest",
        "connection_timeout_seconds": 1,
        "pool": { "max_channels": 8 },
        "topology": {
            "exchanges": [{ "name": "notifications", "kind": "fanout", "durable": true }],
            "queues": [
                { "name": "notifications.email", "durable": true },
                { "name": "notifications.sms", "durable": true }
            ],
            "binds": [
                { "queue_name": "notifications.email", "exchange_name": "notifications" },
                { "queue_name": "notifications.sms", "exchange_name": "notifications" }
            ]
        }
    }))
    .unwrap();

    let broker = Broker::builder(mock.clone())
        .settings(&settings)
        .build()
        .await
        .unwrap();
    broker
        .publish("notifications", "", true, b"{}")
        .await
        .unwrap();

    assert_eq!(mock.queue_depth("notifications.email"), 1);
    assert_eq!(mock.queue_depth("notifications.sms"), 1);
}
