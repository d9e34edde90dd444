//! Routes messages to two queues through a `direct` exchange.
//!
//! Odd messages go to `notification_priority_high`, even ones to `notification_priority_low`.
//! Requires a RabbitMq broker listening on localhost:5672.
use futures_util::StreamExt;
use hutch::amqp::configuration::BrokerSettings;
use hutch::{Broker, Topology};
use std::time::Duration;
use tokio::sync::watch;

const EXCHANGE: &str = "notifications";
const HIGH: &str = "notification_priority_high";
const LOW: &str = "notification_priority_low";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = BrokerSettings {
        topology: Some(
            Topology::default()
                .exchange(EXCHANGE, "direct", false)
                .queue(HIGH, false)
                .queue(LOW, false)
                .bind(HIGH, EXCHANGE, "high")
                .bind(LOW, EXCHANGE, "low"),
        ),
        ..BrokerSettings::default()
    };
    let broker = Broker::connect(&settings).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = vec![
        tokio::spawn(consume(broker.clone(), "Consumer1", HIGH, shutdown_rx.clone())),
        tokio::spawn(consume(broker.clone(), "Consumer2", LOW, shutdown_rx)),
    ];

    for i in 1..6 {
        let routing_key = if i % 2 == 0 { "low" } else { "high" };
        let message = format!("hello: {i}");
        println!("Publishing message: {message}");
        broker
            .publish(EXCHANGE, routing_key, false, message.as_bytes())
            .await?;
    }

    // Give the consumers some time to drain the queues.
    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown_tx.send_replace(true);
    for consumer in consumers {
        consumer.await??;
    }

    broker.delete_exchange(EXCHANGE).await?;
    broker.delete_queue(HIGH).await?;
    broker.delete_queue(LOW).await?;
    broker.close().await?;
    Ok(())
}

async fn consume(
    broker: Broker,
    consumer_name: &'static str,
    queue: &'static str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), hutch::BrokerError> {
    let mut deliveries = broker.consume(consumer_name, queue).await?;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                println!("{consumer_name}: shutting down");
                return deliveries.cancel().await;
            }
            delivery = deliveries.next() => {
                let Some(delivery) = delivery else {
                    println!("{consumer_name}: consumer cancelled by the broker");
                    return Ok(());
                };
                let delivery = delivery?;
                println!(
                    "[{consumer_name}]: Received message: {}",
                    String::from_utf8_lossy(&delivery.data)
                );
                if let Err(e) = broker.ack(&delivery).await {
                    println!("{consumer_name}: Failed to ack message: {e}");
                }
            }
        }
    }
}
