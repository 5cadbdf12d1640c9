// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! User code plugs into the subscriber by implementing [`MessageHandler`].

use crate::{errors::HandlerError, message::DistributedMessage};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;

/// Processes one consumed message.
///
/// Handlers are called concurrently, one call per delivery. Returning `Ok`
/// acknowledges the delivery; returning `Err`, or panicking, rejects it, requeued
/// or not according to the subscriber's `requeue_on_nack`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;

    /// Handles one message.
    ///
    /// # Parameters
    /// * `ctx` - Trace context extracted from the message headers
    /// * `message` - Decoded payload with the identifiers of its envelope
    ///
    /// # Returns
    /// `Ok` to acknowledge the delivery, `Err` to reject it
    async fn handle(
        &self,
        ctx: &Context,
        message: DistributedMessage<Self::Payload>,
    ) -> Result<(), HandlerError>;

    /// Payload handed to [`handle`](Self::handle) when a body cannot be decoded
    /// under the best-effort decode policy.
    ///
    /// Returning `None`, the default, rejects undecodable bodies under either policy.
    fn fallback_payload(&self) -> Option<Self::Payload> {
        None
    }
}
