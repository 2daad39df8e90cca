use std::sync::Arc;
use std::time::Duration;

use mailroute::transport::InMemory;
use mailroute::{
    AsAny, CreationPolicy, JsonCodec, Message, MessageTypeMapping, PropertyValue, ReceiveMode,
    RouterConfig,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

trait OrderEvent: Message {
    fn order_id(&self) -> u32;
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    id: u32,
    amount: u64,
}

impl Message for OrderPlaced {}

impl OrderEvent for OrderPlaced {
    fn order_id(&self) -> u32 {
        self.id
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderCancelled {
    id: u32,
    reason: String,
}

impl Message for OrderCancelled {}

impl OrderEvent for OrderCancelled {
    fn order_id(&self) -> u32 {
        self.id
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let broker = InMemory::default();

    let mut config = RouterConfig::new();
    config
        .add_mapping(
            MessageTypeMapping::queue::<dyn OrderEvent>("orders")
                .with_receive_mode(ReceiveMode::PeekLock)
                .with_creation_policy(CreationPolicy::CreateIfNotExists),
        )
        .unwrap()
        .message::<OrderPlaced, _>(JsonCodec::new())
        .unwrap()
        .message::<OrderCancelled, _>(JsonCodec::new())
        .unwrap()
        .member_of::<OrderPlaced, dyn OrderEvent>(|e| Arc::new(e))
        .member_of::<OrderCancelled, dyn OrderEvent>(|e| Arc::new(e))
        .property_provider::<OrderPlaced, _>(|e: &OrderPlaced| {
            vec![("Amount".to_owned(), PropertyValue::from(e.amount))]
        });

    let router = config.build(Arc::new(broker.clone())).unwrap();
    router.verify_entities(&broker).await.unwrap();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let source = router.source::<dyn OrderEvent>().unwrap();
    let mut messages = source.messages();
    let consumer_router = router.clone();
    let consumer_handle = tokio::spawn(async move {
        let locks = consumer_router.lock_controls();
        let properties = consumer_router.properties();

        while let Some(item) = messages.next().await {
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    tracing::error!(%err, "Failed to read order event");
                    continue;
                }
            };

            let delivery_count = properties
                .incoming(event.as_ref())
                .map(|p| p.delivery_count())
                .unwrap_or_default();
            let control = locks.control_for(event.as_ref()).unwrap();

            match AsAny::as_any(event.as_ref()).downcast_ref::<OrderCancelled>() {
                Some(cancelled) if cancelled.reason.is_empty() => {
                    control.reject("MissingReason", "cancellation without reason").await.unwrap();
                }
                _ => {
                    tracing::info!(
                        order_id = event.order_id(),
                        type_name = event.type_name(),
                        delivery_count,
                        "Order event handled",
                    );
                    control.complete().await.unwrap();
                }
            }
        }
    });

    let publisher = router.publisher::<dyn OrderEvent>();
    let mut id = 0;
    while !cancel.is_cancelled() {
        publisher
            .publish(&OrderPlaced { id, amount: 100 + u64::from(id) })
            .await
            .expect("Failed to publish order");

        if id % 3 == 2 {
            let reason = if id % 2 == 0 { "" } else { "out of stock" };
            publisher
                .publish(&OrderCancelled {
                    id,
                    reason: reason.to_owned(),
                })
                .await
                .expect("Failed to publish cancellation");
        }

        id += 1;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    source.dispose();
    publisher.close().await.unwrap();
    consumer_handle.await.unwrap();

    tracing::info!(
        dead_letters = broker.dead_letters("orders").await.len(),
        "Shut down",
    );
}
