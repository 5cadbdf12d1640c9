// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Declares its exchange once at construction, then publishes JSON-encoded
//! payloads with their envelope and the caller's trace context in the headers.
//!
//! `publish` keeps no state between calls and may be called concurrently through a
//! shared publisher, as long as the transport's publish is safe for concurrent use.
//! Nothing is retried here.

use crate::{
    config::PublisherConfig,
    errors::BrokerError,
    exchange::ExchangeDefinition,
    message::{DistributedPayload, Envelope},
    otel,
    reporter::Reporter,
    transport::Transport,
};
use opentelemetry::Context;
use std::sync::Arc;
use tracing::debug;

/// Publishes messages to one exchange.
pub struct MessagePublisher {
    transport: Arc<dyn Transport>,
    config: PublisherConfig,
    reporter: Arc<dyn Reporter>,
}

impl MessagePublisher {
    /// Validates the configuration and declares the exchange.
    ///
    /// A failed declaration fails construction; there is no half-initialized publisher.
    pub async fn new(
        config: PublisherConfig,
        transport: Arc<dyn Transport>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<MessagePublisher, BrokerError> {
        config.validate()?;

        let exchange = ExchangeDefinition::new(&config.exchange_name)
            .kind(config.kind()?)
            .durability(config.durable);

        if let Err(err) = transport.declare_exchange(&exchange).await {
            reporter.report_error(&err, "error occurred while declaring exchange");
            return Err(err.into());
        }

        Ok(MessagePublisher {
            transport,
            config,
            reporter,
        })
    }

    pub fn exchange_name(&self) -> &str {
        &self.config.exchange_name
    }

    /// Publishes `payload` to the exchange with the given routing key.
    ///
    /// Serialization failures are reported as warnings and returned as
    /// [`BrokerError::Serialization`]; transport failures are returned as they are.
    pub async fn publish<P>(
        &self,
        ctx: &Context,
        routing_key: &str,
        payload: &P,
    ) -> Result<(), BrokerError>
    where
        P: DistributedPayload + ?Sized,
    {
        let body = match serde_json::to_vec(payload.data()) {
            Ok(body) => body,
            Err(err) => {
                self.reporter.report_warning(
                    Some(&err),
                    &format!(
                        "error occurred while creating JSON payload for message {}",
                        payload.message_id()
                    ),
                );
                return Err(err.into());
            }
        };

        let mut envelope = Envelope::for_payload(payload);
        otel::inject(ctx, &mut envelope.headers);

        if let Err(err) = self
            .transport
            .publish(
                &self.config.exchange_name,
                routing_key,
                self.config.mandatory_queue_bind,
                &envelope,
                &body,
            )
            .await
        {
            self.reporter.report_warning(
                Some(&err),
                &format!(
                    "error occurred while publishing to exchange {} with routing key {}",
                    self.config.exchange_name, routing_key
                ),
            );
            return Err(err.into());
        }

        debug!(
            exchange = self.config.exchange_name.as_str(),
            routing_key, "message published"
        );

        Ok(())
    }
}
