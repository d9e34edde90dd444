//! Runs against a real RabbitMq, e.g. `docker run -p 5672:5672 rabbitmq:3`.
use crate::helpers::random_name;
use futures_util::StreamExt;
use hutch::amqp::configuration::BrokerSettings;
use hutch::Broker;
use std::time::Duration;

#[tokio::test]
#[ignore = "requires a RabbitMq broker listening on localhost:5672"]
async fn round_trip_against_a_live_broker() {
    let broker = Broker::connect(&BrokerSettings::default()).await.unwrap();
    let exchange = random_name("exchange");
    let queue = random_name("queue");

    broker.create_exchange(&exchange, "direct", false).await.unwrap();
    broker.create_queue(&queue, false).await.unwrap();
    broker
        .bind_queue_to_exchange(&queue, &exchange, "high")
        .await
        .unwrap();
    broker
        .publish(&exchange, "high", false, br#"{"hello": "world"}"#)
        .await
        .unwrap();

    let mut deliveries = broker.consume(&random_name("consumer"), &queue).await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
        .await
        .expect("No delivery within 5 seconds")
        .unwrap()
        .unwrap();
    assert_eq!(delivery.data, br#"{"hello": "world"}"#);
    broker.ack(&delivery).await.unwrap();
    deliveries.cancel().await.unwrap();

    broker.delete_queue(&queue).await.unwrap();
    broker.delete_exchange(&exchange).await.unwrap();
    broker.close().await.unwrap();
}
