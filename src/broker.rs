// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Facade
//!
//! Validates a [`Config`], opens the transport and builds the roles the
//! configuration asks for. A broker can be a publisher, a subscriber, or both
//! sharing one session.
//!
//! ```no_run
//! use rabbitmq_broker::{
//!     binding::BindingType,
//!     broker::MessageBroker,
//!     config::{Config, PublisherConfig},
//!     message::DistributedMessage,
//!     reporter::TracingReporter,
//! };
//! use opentelemetry::Context;
//!
//! # async fn run() -> Result<(), rabbitmq_broker::errors::BrokerError> {
//! let config = Config::new("guest", "guest", "localhost", "/")
//!     .publisher(PublisherConfig::new("orders", BindingType::Topic).durable());
//!
//! let broker = MessageBroker::connect_publisher(config, TracingReporter::shared()).await?;
//! broker
//!     .publish(&Context::current(), "orders.new", &DistributedMessage::new("book"))
//!     .await?;
//! broker.close().await
//! # }
//! ```

use crate::{
    channel::AmqpSession,
    config::Config,
    errors::BrokerError,
    handler::MessageHandler,
    message::DistributedPayload,
    publisher::MessagePublisher,
    reporter::Reporter,
    subscriber::MessageSubscriber,
    transport::Transport,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::debug;

/// Which roles a broker builds from its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Roles {
    Subscriber,
    Publisher,
    Both,
    /// Whatever role configurations are present
    Configured,
}

/// Publisher and/or subscriber sharing one transport.
pub struct MessageBroker {
    config: Config,
    transport: Arc<dyn Transport>,
    publisher: Option<MessagePublisher>,
    subscriber: Option<MessageSubscriber>,
    reporter: Arc<dyn Reporter>,
}

impl MessageBroker {
    /// Connects to RabbitMQ as a subscriber. Requires `subscriber_config`.
    pub async fn connect_subscriber(
        config: Config,
        reporter: Arc<dyn Reporter>,
    ) -> Result<MessageBroker, BrokerError> {
        MessageBroker::connect_with(config, reporter, Roles::Subscriber).await
    }

    /// Connects to RabbitMQ as a publisher. Requires `publisher_config`.
    pub async fn connect_publisher(
        config: Config,
        reporter: Arc<dyn Reporter>,
    ) -> Result<MessageBroker, BrokerError> {
        MessageBroker::connect_with(config, reporter, Roles::Publisher).await
    }

    /// Connects to RabbitMQ as both publisher and subscriber over one session.
    pub async fn connect(
        config: Config,
        reporter: Arc<dyn Reporter>,
    ) -> Result<MessageBroker, BrokerError> {
        MessageBroker::connect_with(config, reporter, Roles::Both).await
    }

    /// Builds the roles present in the configuration over an existing transport.
    pub async fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<MessageBroker, BrokerError> {
        MessageBroker::build(config, transport, reporter, Roles::Configured).await
    }

    async fn connect_with(
        config: Config,
        reporter: Arc<dyn Reporter>,
        roles: Roles,
    ) -> Result<MessageBroker, BrokerError> {
        // nothing is dialed for a configuration that cannot be used
        check(&config, roles, reporter.as_ref())?;

        let session = match AmqpSession::connect(&config).await {
            Ok(session) => session,
            Err(err) => {
                reporter.report_error(&err, "failure to connect to rabbitmq");
                return Err(err.into());
            }
        };

        MessageBroker::build(config, Arc::new(session), reporter, roles).await
    }

    async fn build(
        config: Config,
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn Reporter>,
        roles: Roles,
    ) -> Result<MessageBroker, BrokerError> {
        check(&config, roles, reporter.as_ref())?;

        let (with_subscriber, with_publisher) = match roles {
            Roles::Subscriber => (true, false),
            Roles::Publisher => (false, true),
            Roles::Both => (true, true),
            Roles::Configured => (
                config.subscriber_config.is_some(),
                config.publisher_config.is_some(),
            ),
        };

        let subscriber = match (&config.subscriber_config, with_subscriber) {
            (Some(cfg), true) => Some(
                MessageSubscriber::new(cfg.clone(), transport.clone(), reporter.clone()).await?,
            ),
            _ => None,
        };

        let publisher = match (&config.publisher_config, with_publisher) {
            (Some(cfg), true) => {
                match MessagePublisher::new(cfg.clone(), transport.clone(), reporter.clone()).await
                {
                    Ok(publisher) => Some(publisher),
                    Err(err) => {
                        reporter.report_error(&err, "failure to set up publisher");
                        return Err(err);
                    }
                }
            }
            _ => None,
        };

        debug!(
            publisher = publisher.is_some(),
            subscriber = subscriber.is_some(),
            "broker ready"
        );

        Ok(MessageBroker {
            config,
            transport,
            publisher,
            subscriber,
            reporter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The publisher role, when the broker was built with one.
    pub fn publisher(&self) -> Option<&MessagePublisher> {
        self.publisher.as_ref()
    }

    /// The subscriber role, when the broker was built with one.
    pub fn subscriber(&self) -> Option<&MessageSubscriber> {
        self.subscriber.as_ref()
    }

    /// Publishes through the publisher role.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the message headers
    /// * `routing_key` - Routing key the exchange routes on
    /// * `payload` - Message to encode and publish
    ///
    /// # Returns
    /// [`BrokerError::NotPublisher`] when the broker has no publisher role,
    /// otherwise the publisher's result
    pub async fn publish<P>(
        &self,
        ctx: &Context,
        routing_key: &str,
        payload: &P,
    ) -> Result<(), BrokerError>
    where
        P: DistributedPayload + ?Sized,
    {
        match &self.publisher {
            Some(publisher) => publisher.publish(ctx, routing_key, payload).await,
            None => Err(BrokerError::NotPublisher),
        }
    }

    /// Runs the subscriber's dispatch loop until the transport is closed.
    pub async fn subscribe<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), BrokerError> {
        match &self.subscriber {
            Some(subscriber) => subscriber.subscribe(handler).await,
            None => Err(BrokerError::NotSubscriber),
        }
    }

    /// Closes the transport. Running `subscribe` calls return once their
    /// in-flight deliveries are resolved.
    pub async fn close(&self) -> Result<(), BrokerError> {
        if let Err(err) = self.transport.close().await {
            self.reporter.report_error(&err, "failure to close broker session");
            return Err(err.into());
        }
        self.reporter.report_verbose("broker session closed");
        Ok(())
    }
}

/// Validates the configuration and checks the requested roles are configured.
fn check(config: &Config, roles: Roles, reporter: &dyn Reporter) -> Result<(), BrokerError> {
    if let Err(err) = config.validate() {
        reporter.report_error(&err, "invalid broker configuration");
        return Err(err.into());
    }

    let missing = match roles {
        Roles::Subscriber | Roles::Both if config.subscriber_config.is_none() => {
            Some(BrokerError::NotSubscriber)
        }
        Roles::Publisher | Roles::Both if config.publisher_config.is_none() => {
            Some(BrokerError::NotPublisher)
        }
        _ => None,
    };

    match missing {
        Some(err) => {
            reporter.report_error(&err, "broker role is not configured");
            Err(err)
        }
        None => Ok(()),
    }
}
