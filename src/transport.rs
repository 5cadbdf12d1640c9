// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Boundary
//!
//! The publisher and the subscriber talk to the broker exclusively through the
//! [`Transport`] trait: topology declaration, publishing, and a stream of
//! [`Delivery`] handles. Two implementations ship with the crate, the lapin-backed
//! [`AmqpSession`](crate::channel::AmqpSession) and the in-process
//! [`MemoryTransport`](crate::memory::MemoryTransport).
//!
//! Implementations must be safe for concurrent use: a single transport is shared by
//! every publish call and by every delivery task resolving its delivery.

use crate::{
    errors::AmqpError, exchange::ExchangeDefinition, message::Envelope,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Stream of deliveries pulled from a queue.
///
/// The stream ends when the underlying channel is closed and cannot be restarted.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>, AmqpError>>;

/// One unacknowledged message handed to a consumer.
///
/// Resolution consumes the handle, so a delivery can be acknowledged or rejected
/// at most once. Dropping a handle without resolving it leaves the message
/// unacknowledged until the channel closes.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Raw message body
    fn body(&self) -> &[u8];

    /// Metadata copied from the delivery properties
    fn envelope(&self) -> &Envelope;

    /// Whether the broker has handed this message out before
    fn redelivered(&self) -> bool;

    /// Acknowledges this delivery alone.
    async fn ack(self: Box<Self>) -> Result<(), AmqpError>;

    /// Rejects this delivery alone, optionally asking the broker to requeue it.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), AmqpError>;
}

/// Broker-facing operations used by the publisher and the subscriber.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares an exchange. Idempotent for an identical existing declaration.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns the name the broker actually uses.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue to an exchange with a routing key.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Bounds the number of unacknowledged deliveries handed out at once; 0 is unbounded.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Publishes one message. Must be safe to call concurrently.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), AmqpError>;

    /// Starts consuming from a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Closes the transport, ending every delivery stream it produced.
    async fn close(&self) -> Result<(), AmqpError>;
}
