// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Subscriber
//!
//! Declares the exchange, queue, prefetch and binding a subscription needs, then
//! runs the dispatch loop: every delivery pulled off the queue is handled in its own
//! task and resolved to exactly one ack or nack.
//!
//! The loop adds no limiter of its own. The prefetch count given to the transport
//! bounds how many unacknowledged deliveries, and therefore how many handler calls,
//! are in flight at once.

use crate::{
    config::SubscriberConfig,
    consumer::{consume, DeliveryPolicy},
    errors::BrokerError,
    exchange::ExchangeDefinition,
    handler::MessageHandler,
    queue::{QueueBinding, QueueDefinition},
    reporter::Reporter,
    transport::Transport,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tracing::debug;

/// Consumes one queue and dispatches its deliveries to a [`MessageHandler`].
pub struct MessageSubscriber {
    transport: Arc<dyn Transport>,
    config: SubscriberConfig,
    queue_name: String,
    reporter: Arc<dyn Reporter>,
}

impl MessageSubscriber {
    /// Validates the configuration and declares the subscription topology.
    ///
    /// Declaration steps are tolerant: a failing step is reported and the next
    /// step still runs. Only an invalid configuration fails construction.
    pub async fn new(
        config: SubscriberConfig,
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<MessageSubscriber, BrokerError> {
        config.validate()?;
        let kind = config.kind()?;

        let exchange = ExchangeDefinition::new(&config.exchange_name)
            .kind(kind)
            .durable();
        if let Err(err) = transport.declare_exchange(&exchange).await {
            reporter.report_error(&err, "error occurred while declaring exchange");
        }

        let queue = QueueDefinition::new(&config.queue_name)
            .durability(config.durable)
            .auto_delete(config.auto_delete_queue)
            .strict(config.strict_queue_name);
        let queue_name = match transport.declare_queue(&queue).await {
            Ok(name) => name,
            Err(err) => {
                reporter.report_error(&err, "error occurred while declaring queue");
                config.queue_name.clone()
            }
        };

        let prefetch = u16::try_from(config.prefetch_count).unwrap_or_default();
        if let Err(err) = transport.set_prefetch(prefetch).await {
            reporter.report_error(&err, "error occurred while setting prefetch count");
        }

        let binding = QueueBinding::new(&queue_name)
            .exchange(&config.exchange_name)
            .routing_key(&config.routing_key);
        if let Err(err) = transport.bind_queue(&binding).await {
            reporter.report_error(&err, "error occurred while binding queue to exchange");
        }

        debug!(
            queue = queue_name.as_str(),
            exchange = config.exchange_name.as_str(),
            "subscriber ready"
        );

        Ok(MessageSubscriber {
            transport,
            config,
            queue_name,
            reporter,
        })
    }

    /// Name of the consumed queue, as assigned by the broker.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Consumes the queue until the transport closes the delivery stream.
    ///
    /// Each delivery runs in its own task; the call returns once the stream has
    /// ended and every in-flight delivery has been resolved. Per-delivery failures
    /// are reported and never end the loop. Failing to start the consumer is the
    /// only error returned.
    pub async fn subscribe<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), BrokerError> {
        let mut deliveries = self
            .transport
            .consume(&self.queue_name, &self.config.consumer_tag)
            .await?;

        let policy = Arc::new(DeliveryPolicy {
            queue: self.queue_name.clone(),
            requeue_on_nack: self.config.requeue_on_nack,
            decode_failure: self.config.decode_failure,
        });

        self.reporter
            .report_info(&format!("waiting for messages on queue {}", self.queue_name));

        let mut tasks = JoinSet::new();

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    let handler = handler.clone();
                    let policy = policy.clone();
                    let reporter = self.reporter.clone();

                    tasks.spawn(async move {
                        if let Err(err) =
                            consume(delivery, handler.as_ref(), &policy, reporter.as_ref()).await
                        {
                            reporter.report_error(&err, "error consume msg");
                        }
                    });
                }
                Err(err) => self.reporter.report_error(&err, "errors consume msg"),
            }

            while let Some(joined) = tasks.try_join_next() {
                self.report_join(joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.report_join(joined);
        }

        self.reporter.report_info(&format!(
            "finished processing all messages on queue {}",
            self.queue_name
        ));

        Ok(())
    }

    fn report_join(&self, joined: Result<(), JoinError>) {
        if let Err(err) = joined {
            self.reporter
                .report_error(&err, "delivery task ended without resolving its delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        binding::BindingType,
        consumer::{testing::ScriptedDelivery, Resolution},
        errors::{AmqpError, HandlerError},
        memory::MemoryBroker,
        message::{DistributedMessage, Envelope},
        reporter::testing::RecordingReporter,
        transport::{Delivery, MockTransport},
    };
    use async_trait::async_trait;
    use futures_util::stream;
    use mockall::predicate::eq;
    use opentelemetry::Context;
    use serde::Deserialize;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    #[derive(Debug, Default, Deserialize)]
    struct Order {
        #[allow(dead_code)]
        id: u32,
    }

    #[derive(Default)]
    struct CountingHandler {
        fail: bool,
        panic: bool,
        delay: Duration,
        handled: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        type Payload = Order;

        async fn handle(
            &self,
            _ctx: &Context,
            _message: DistributedMessage<Order>,
        ) -> Result<(), HandlerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);

            if self.panic {
                panic!("handler crashed");
            }
            if self.fail {
                return Err(HandlerError::new("cannot process order"));
            }
            Ok(())
        }
    }

    fn config(requeue_on_nack: bool) -> SubscriberConfig {
        SubscriberConfig::new("orders", BindingType::Direct)
            .queue("orders.created")
            .routing_key("created")
            .prefetch(5)
            .requeue_on_nack(requeue_on_nack)
    }

    fn ready_transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_declare_exchange().returning(|_| Ok(()));
        transport
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        transport.expect_set_prefetch().returning(|_| Ok(()));
        transport.expect_bind_queue().returning(|_| Ok(()));
        transport
    }

    fn scripted(
        count: usize,
        resolutions: &Arc<Mutex<Vec<Resolution>>>,
    ) -> Vec<Result<Box<dyn Delivery>, AmqpError>> {
        (0..count)
            .map(|id| {
                let body = format!(r#"{{"id": {id}}}"#);
                let delivery = ScriptedDelivery::new(body.as_bytes(), resolutions.clone());
                Ok(Box::new(delivery) as Box<dyn Delivery>)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_setup_failures_are_reported_and_tolerated() {
        let mut transport = MockTransport::new();
        transport
            .expect_declare_exchange()
            .times(1)
            .returning(|_| Err(AmqpError::DeclareExchangeError("orders".to_owned())));
        transport
            .expect_declare_queue()
            .withf(|def| def.name().is_empty() && !def.is_strict())
            .times(1)
            .returning(|_| Ok("amq.gen-1".to_owned()));
        transport
            .expect_set_prefetch()
            .with(eq(5))
            .times(1)
            .returning(|_| Err(AmqpError::QoSDeclarationError("amq.gen-1".to_owned())));
        transport
            .expect_bind_queue()
            .withf(|binding| {
                binding.queue_name() == "amq.gen-1"
                    && binding.exchange_name() == "orders"
                    && binding.key() == "created"
            })
            .times(1)
            .returning(|_| Ok(()));

        let reporter = Arc::new(RecordingReporter::default());
        let cfg = SubscriberConfig::new("orders", BindingType::Direct)
            .routing_key("created")
            .prefetch(5);
        let subscriber = MessageSubscriber::new(cfg, Arc::new(transport), reporter.clone())
            .await
            .expect("subscriber");

        assert_eq!(subscriber.queue_name(), "amq.gen-1");
        assert_eq!(reporter.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_every_successful_delivery_is_acked_once() {
        let resolutions = Arc::new(Mutex::new(vec![]));
        let mut items = scripted(10, &resolutions);
        items.insert(4, Err(AmqpError::ConsumerError("orders.created".to_owned())));

        let mut transport = ready_transport();
        transport
            .expect_consume()
            .with(eq("orders.created"), eq(""))
            .times(1)
            .return_once(move |_, _| Ok(Box::pin(stream::iter(items))));

        let reporter = Arc::new(RecordingReporter::default());
        let subscriber = MessageSubscriber::new(config(true), Arc::new(transport), reporter.clone())
            .await
            .expect("subscriber");

        let handler = Arc::new(CountingHandler::default());
        subscriber.subscribe(handler.clone()).await.expect("subscribe");

        assert_eq!(handler.handled.load(Ordering::SeqCst), 10);
        let resolutions = resolutions.lock().unwrap();
        assert_eq!(resolutions.len(), 10);
        assert!(resolutions.iter().all(|r| *r == Resolution::Acked));
        // the stream error alone
        assert_eq!(reporter.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_rejects_with_configured_requeue() {
        for requeue in [true, false] {
            let resolutions = Arc::new(Mutex::new(vec![]));
            let items = scripted(4, &resolutions);

            let mut transport = ready_transport();
            transport
                .expect_consume()
                .times(1)
                .return_once(move |_, _| Ok(Box::pin(stream::iter(items))));

            let subscriber = MessageSubscriber::new(
                config(requeue),
                Arc::new(transport),
                Arc::new(RecordingReporter::default()),
            )
            .await
            .expect("subscriber");

            let handler = Arc::new(CountingHandler {
                fail: true,
                ..Default::default()
            });
            subscriber.subscribe(handler).await.expect("subscribe");

            let resolutions = resolutions.lock().unwrap();
            assert_eq!(*resolutions, vec![Resolution::Rejected { requeue }; 4]);
        }
    }

    #[tokio::test]
    async fn test_consume_failure_is_returned() {
        let mut transport = ready_transport();
        transport
            .expect_consume()
            .times(1)
            .returning(|queue, _| Err(AmqpError::ConsumerDeclarationError(queue.to_owned())));

        let subscriber = MessageSubscriber::new(
            config(false),
            Arc::new(transport),
            Arc::new(RecordingReporter::default()),
        )
        .await
        .expect("subscriber");

        let res = subscriber.subscribe(Arc::new(CountingHandler::default())).await;
        assert!(matches!(
            res,
            Err(BrokerError::Transport(AmqpError::ConsumerDeclarationError(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_prefetch_bounds_concurrent_handlers() {
        let broker = MemoryBroker::new();
        let cfg = SubscriberConfig::new("orders", BindingType::Fanout)
            .queue("orders.all")
            .prefetch(2);
        let subscriber = Arc::new(
            MessageSubscriber::new(
                cfg,
                Arc::new(broker.channel()),
                Arc::new(RecordingReporter::default()),
            )
            .await
            .expect("subscriber"),
        );

        let producer = broker.channel();
        for id in 0..8 {
            producer
                .publish(
                    "orders",
                    "",
                    false,
                    &Envelope::default(),
                    format!(r#"{{"id": {id}}}"#).as_bytes(),
                )
                .await
                .expect("publish");
        }

        let handler = Arc::new(CountingHandler {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        let running = tokio::spawn({
            let subscriber = subscriber.clone();
            let handler = handler.clone();
            async move { subscriber.subscribe(handler).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 8 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("all deliveries handled");

        broker.close();
        running.await.expect("join").expect("subscribe");

        assert!(handler.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(broker.stats().acked, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_handler_still_resolves_every_delivery() {
        let broker = MemoryBroker::new();
        let cfg = SubscriberConfig::new("orders", BindingType::Fanout)
            .queue("orders.all")
            .prefetch(1)
            .requeue_on_nack(false);
        let reporter = Arc::new(RecordingReporter::default());
        let subscriber = Arc::new(
            MessageSubscriber::new(cfg, Arc::new(broker.channel()), reporter.clone())
                .await
                .expect("subscriber"),
        );

        let producer = broker.channel();
        for id in 0..2 {
            producer
                .publish(
                    "orders",
                    "",
                    false,
                    &Envelope::default(),
                    format!(r#"{{"id": {id}}}"#).as_bytes(),
                )
                .await
                .expect("publish");
        }

        let handler = Arc::new(CountingHandler {
            panic: true,
            ..Default::default()
        });
        let running = tokio::spawn({
            let subscriber = subscriber.clone();
            let handler = handler.clone();
            async move { subscriber.subscribe(handler).await }
        });

        // with a single prefetch credit the second delivery needs the first resolved
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.stats().rejected < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both deliveries rejected");

        broker.close();
        running.await.expect("join").expect("subscribe");

        let stats = broker.stats();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
        assert_eq!((stats.acked, stats.rejected, stats.requeued), (0, 2, 0));
        assert_eq!(reporter.errors().len(), 2);
    }
}
