use crate::helpers::{orders_topology, wait_for_state, MockBroker};
use fake::faker::lorem::en::Sentence;
use fake::Fake;
use futures_util::StreamExt;
use hutch::pool::ConnectionState;
use hutch::{Broker, BrokerError, Operation};
use std::time::Duration;

async fn get_broker(mock: &MockBroker) -> Broker<MockBroker> {
    Broker::builder(mock.clone())
        .topology(orders_topology())
        .build()
        .await
        .expect("Failed to build the broker")
}

#[tokio::test(start_paused = true)]
async fn a_published_message_is_consumed_once_and_not_redelivered_after_ack() {
    let mock = MockBroker::new();
    let broker = Broker::builder(mock.clone()).build().await.unwrap();

    broker.create_exchange("orders", "direct", false).await.unwrap();
    broker.create_queue("orders.high", false).await.unwrap();
    broker
        .bind_queue_to_exchange("orders.high", "orders", "high")
        .await
        .unwrap();
    broker.publish("orders", "high", false, b"hello").await.unwrap();

    let mut deliveries = broker.consume("billing", "orders.high").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(delivery.data, b"hello");
    assert_eq!(delivery.exchange, "orders");
    assert_eq!(delivery.routing_key, "high");
    assert!(!delivery.redelivered);

    broker.ack(&delivery).await.unwrap();

    assert_eq!(mock.acked(), 1);
    assert_eq!(mock.unacked(), 0);
    assert_eq!(mock.queue_depth("orders.high"), 0);
    assert!(
        tokio::time::timeout(Duration::from_millis(500), deliveries.next())
            .await
            .is_err(),
        "The message was redelivered after being acked"
    );
}

#[tokio::test]
async fn messages_are_published_as_json_with_the_requested_durability() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;

    broker.publish("orders", "high", true, b"{}").await.unwrap();
    broker.publish("orders", "high", false, b"{}").await.unwrap();

    let mut deliveries = broker.consume("billing", "orders.high").await.unwrap();
    let persistent = deliveries.next().await.unwrap().unwrap();
    broker.ack(&persistent).await.unwrap();
    let transient = deliveries.next().await.unwrap().unwrap();
    broker.ack(&transient).await.unwrap();

    assert_eq!(
        persistent
            .properties
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str()),
        Some("application/json")
    );
    assert_eq!(*persistent.properties.delivery_mode(), Some(2));
    assert_eq!(*transient.properties.delivery_mode(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn publishing_succeeds_again_after_the_connection_is_lost() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;
    let mut deliveries = broker.consume("billing", "orders.high").await.unwrap();

    mock.drop_connections();

    // The consumer learns about the loss, then its stream ends.
    let error = deliveries.next().await.unwrap().unwrap_err();
    assert_eq!(error.failed_operation(), Some(Operation::Consume));
    assert!(deliveries.next().await.is_none());

    tokio::time::timeout(
        Duration::from_secs(10),
        broker.publish("orders", "high", false, b"after the storm"),
    )
    .await
    .expect("Publish did not succeed within the reconnect ceiling")
    .unwrap();

    let mut deliveries = broker.consume("billing", "orders.high").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(delivery.data, b"after the storm");
    broker.ack(&delivery).await.unwrap();
    assert_eq!(
        broker.status().connection,
        ConnectionState::Connected { generation: 2 }
    );
}

#[tokio::test(start_paused = true)]
async fn unacked_deliveries_are_redelivered_after_a_connection_loss() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;
    let body: String = Sentence(3..8).fake();
    broker
        .publish("orders", "high", true, body.as_bytes())
        .await
        .unwrap();

    let mut deliveries = broker.consume("billing", "orders.high").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert!(!delivery.redelivered);

    mock.drop_connections();
    assert!(broker.ack(&delivery).await.is_err());
    assert_eq!(mock.queue_depth("orders.high"), 1);

    wait_for_state(
        broker.pool().connection_manager(),
        ConnectionState::Connected { generation: 2 },
    )
    .await;
    let mut deliveries = broker.consume("billing", "orders.high").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();

    assert!(delivery.redelivered);
    assert_eq!(delivery.data, body.as_bytes());
    broker.ack(&delivery).await.unwrap();
    assert_eq!(mock.unacked(), 0);
}

#[tokio::test]
async fn an_invalid_exchange_kind_does_not_poison_the_pool() {
    let mock = MockBroker::new();
    let broker = Broker::builder(mock.clone()).build().await.unwrap();

    let error = broker.create_exchange("orders", "", false).await.unwrap_err();

    assert!(matches!(
        error,
        BrokerError::Operation {
            operation: Operation::CreateExchange,
            ..
        }
    ));
    assert!(!mock.has_exchange("orders"));

    broker.create_exchange("orders", "direct", false).await.unwrap();
    broker.create_queue("orders.high", false).await.unwrap();
    broker
        .bind_queue_to_exchange("orders.high", "orders", "high")
        .await
        .unwrap();
    broker.publish("orders", "high", false, b"hello").await.unwrap();
    assert_eq!(mock.queue_depth("orders.high"), 1);
}

#[tokio::test]
async fn a_mismatched_redeclaration_is_an_operation_failure() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;

    // Same flags: a no-op.
    broker.create_queue("orders.high", false).await.unwrap();

    let error = broker.create_queue("orders.high", true).await.unwrap_err();
    assert_eq!(error.failed_operation(), Some(Operation::CreateQueue));

    let error = broker
        .create_exchange("orders", "fanout", false)
        .await
        .unwrap_err();
    assert_eq!(error.failed_operation(), Some(Operation::CreateExchange));
}

#[tokio::test]
async fn fanout_exchanges_copy_messages_to_every_bound_queue() {
    let mock = MockBroker::new();
    let broker = Broker::builder(mock.clone()).build().await.unwrap();
    broker
        .create_exchange("broadcast", "fanout", true)
        .await
        .unwrap();
    for queue in ["broadcast.a", "broadcast.b"] {
        broker.create_queue(queue, true).await.unwrap();
        broker
            .bind_queue_to_exchange(queue, "broadcast", "")
            .await
            .unwrap();
    }

    broker
        .publish("broadcast", "ignored", true, b"to everyone")
        .await
        .unwrap();

    assert_eq!(mock.queue_depth("broadcast.a"), 1);
    assert_eq!(mock.queue_depth("broadcast.b"), 1);
}

#[tokio::test]
async fn topic_exchanges_route_on_patterns() {
    let mock = MockBroker::new();
    let broker = Broker::builder(mock.clone()).build().await.unwrap();
    broker.create_exchange("events", "topic", false).await.unwrap();
    broker.create_queue("events.orders", false).await.unwrap();
    broker.create_queue("events.all", false).await.unwrap();
    broker
        .bind_queue_to_exchange("events.orders", "events", "orders.*")
        .await
        .unwrap();
    broker
        .bind_queue_to_exchange("events.all", "events", "#")
        .await
        .unwrap();

    broker
        .publish("events", "orders.created", false, b"{}")
        .await
        .unwrap();
    broker
        .publish("events", "users.created", false, b"{}")
        .await
        .unwrap();

    assert_eq!(mock.queue_depth("events.orders"), 1);
    assert_eq!(mock.queue_depth("events.all"), 2);
}

#[tokio::test]
async fn unbound_queues_stop_receiving_messages() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;

    broker
        .unbind_queue_from_exchange("orders.high", "orders", "high")
        .await
        .unwrap();
    broker.publish("orders", "high", false, b"lost").await.unwrap();

    assert!(!mock.has_binding("orders.high", "orders", "high"));
    assert_eq!(mock.queue_depth("orders.high"), 0);
}

#[tokio::test]
async fn deleted_entities_are_gone() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;

    broker.delete_queue("orders.high").await.unwrap();
    broker.delete_exchange("orders").await.unwrap();

    assert!(!mock.has_queue("orders.high"));
    assert!(!mock.has_exchange("orders"));
    let error = broker.consume("billing", "orders.high").await.unwrap_err();
    assert_eq!(error.failed_operation(), Some(Operation::Consume));
    let error = broker
        .publish("orders", "high", false, b"{}")
        .await
        .unwrap_err();
    assert_eq!(error.failed_operation(), Some(Operation::Publish));
}

#[tokio::test]
async fn consumers_take_turns_and_respect_the_prefetch() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;
    let mut first = broker.consume("first", "orders.high").await.unwrap();
    let mut second = broker.consume("second", "orders.high").await.unwrap();

    for body in [b"1", b"2", b"3"] {
        broker.publish("orders", "high", false, body).await.unwrap();
    }

    let one = first.next().await.unwrap().unwrap();
    let two = second.next().await.unwrap().unwrap();
    assert_eq!(one.data, b"1");
    assert_eq!(two.data, b"2");
    // Both consumers are at their prefetch limit.
    assert_eq!(mock.queue_depth("orders.high"), 1);

    broker.ack(&one).await.unwrap();
    let three = first.next().await.unwrap().unwrap();
    assert_eq!(three.data, b"3");
    broker.ack(&two).await.unwrap();
    broker.ack(&three).await.unwrap();
    assert_eq!(mock.acked(), 3);
}

#[tokio::test]
async fn cancelling_a_consumer_requeues_its_unacked_deliveries() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;
    broker.publish("orders", "high", false, b"{}").await.unwrap();
    let open_channels = mock.open_channels();

    let mut deliveries = broker.consume("billing", "orders.high").await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();
    assert_eq!(mock.unacked(), 1);

    deliveries.cancel().await.unwrap();

    assert_eq!(mock.unacked(), 0);
    assert_eq!(mock.queue_depth("orders.high"), 1);
    assert!(broker.ack(&delivery).await.is_err());
    assert_eq!(mock.open_channels(), open_channels - 1);
}

#[tokio::test]
async fn dropping_a_consumer_cancels_it_in_the_background() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;
    let deliveries = broker.consume("billing", "orders.high").await.unwrap();
    assert_eq!(deliveries.consumer_tag(), "billing");

    assert_eq!(mock.consumer_count("orders.high"), 1);

    drop(deliveries);
    tokio::time::timeout(Duration::from_secs(1), async {
        while mock.consumer_count("orders.high") > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("The consumer was never cancelled");

    broker.publish("orders", "high", false, b"{}").await.unwrap();
    assert_eq!(mock.queue_depth("orders.high"), 1);
}

#[tokio::test(start_paused = true)]
async fn the_operation_timeout_bounds_the_wait_for_a_channel() {
    let mock = MockBroker::new();
    let broker = Broker::builder(mock.clone())
        .operation_timeout(Duration::from_secs(2))
        .build()
        .await
        .unwrap();

    mock.refuse_connections(true);
    mock.drop_connections();
    wait_for_state(
        broker.pool().connection_manager(),
        ConnectionState::Disconnected,
    )
    .await;

    let error = broker
        .publish("orders", "high", false, b"{}")
        .await
        .unwrap_err();

    assert!(matches!(error, BrokerError::Timeout(Operation::Publish)));
}

#[tokio::test]
async fn operations_fail_fast_once_the_broker_is_closed() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;
    let clone = broker.clone();

    broker.close().await.unwrap();
    broker.close().await.unwrap();

    assert!(clone
        .publish("orders", "high", false, b"{}")
        .await
        .unwrap_err()
        .is_closed());
    assert!(clone
        .consume("billing", "orders.high")
        .await
        .unwrap_err()
        .is_closed());
    assert_eq!(mock.open_connections(), 0);
}

#[tokio::test]
async fn a_consumer_that_failed_to_subscribe_gives_its_channel_back() {
    let mock = MockBroker::new();
    let broker = get_broker(&mock).await;
    let idle = broker.status().idle;
    let open_channels = mock.open_channels();
    mock.fail_next_qos();

    let error = broker.consume("billing", "orders.high").await.unwrap_err();
    // Give a background cancellation, if any, a chance to run.
    tokio::task::yield_now().await;

    assert_eq!(error.failed_operation(), Some(Operation::Consume));
    assert_eq!(mock.cancels(), 0);
    assert_eq!(mock.open_channels(), open_channels);
    assert_eq!(broker.status().idle, idle);
}
