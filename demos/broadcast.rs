//! Copies every message to two queues through a `fanout` exchange.
//!
//! Requires a RabbitMq broker listening on localhost:5672.
use futures_util::StreamExt;
use hutch::amqp::configuration::BrokerSettings;
use hutch::{Broker, Topology};
use std::time::Duration;

const EXCHANGE: &str = "notifications";
const QUEUES: [&str; 2] = ["notification_priority_high", "notification_priority_low"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut topology = Topology::default().exchange(EXCHANGE, "fanout", false);
    for queue in QUEUES {
        // Routing keys are ignored by fanout exchanges.
        topology = topology.queue(queue, false).bind(queue, EXCHANGE, "");
    }
    let broker = Broker::builder(hutch::amqp::ConnectionFactory::new_from_config(
        &BrokerSettings::default(),
    )?)
    .topology(topology)
    .operation_timeout(Duration::from_secs(5))
    .build()
    .await?;

    for i in 1..6 {
        let message = format!("hello: {i}");
        println!("Publishing message: {message}");
        broker.publish(EXCHANGE, "", false, message.as_bytes()).await?;
    }

    for (i, queue) in QUEUES.into_iter().enumerate() {
        let consumer_name = format!("Consumer{}", i + 1);
        let mut deliveries = broker.consume(&consumer_name, queue).await?;
        // Each queue got its own copy of the five messages.
        for _ in 0..5 {
            let Ok(Some(delivery)) =
                tokio::time::timeout(Duration::from_secs(3), deliveries.next()).await
            else {
                println!("{consumer_name}: no more messages");
                break;
            };
            let delivery = delivery?;
            println!(
                "[{consumer_name}]: Received message: {}",
                String::from_utf8_lossy(&delivery.data)
            );
            broker.ack(&delivery).await?;
        }
        deliveries.cancel().await?;
    }

    broker.delete_exchange(EXCHANGE).await?;
    for queue in QUEUES {
        broker.delete_queue(queue).await?;
    }
    broker.close().await?;
    Ok(())
}
