// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Broker Client
//!
//! Four families of failures are kept apart:
//! - `ValidationError`: structural misconfiguration, found before any network resource is touched
//! - `AmqpError`: failures reported by the transport (connect, declare, bind, publish, consume, ack)
//! - `HandlerError`: failures reported by user handler code
//! - `BrokerError`: what the publish/subscribe entry points return to their caller

use crate::binding::BindingType;
use thiserror::Error;

/// Structural errors in a topology configuration.
///
/// Validation is fail-fast: only the first violated rule is reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required string field is empty. Carries the field path.
    #[error("{0} is empty string")]
    EmptyField(&'static str),

    /// Neither a subscriber nor a publisher configuration was supplied
    #[error("subscriber_config and publisher_config are missing, a broker client must be a publisher, a subscriber or both")]
    MissingRole,

    /// Binding type integer outside `[0, 2]`
    #[error("binding type `{0}` is out of range, expected 0 (fanout), 1 (direct) or 2 (topic)")]
    BindingTypeOutOfRange(i32),

    /// Direct and topic bindings need a routing key
    #[error("subscriber_config.routing_key is empty string, cannot bind a queue with {0} routing and no routing key")]
    MissingRoutingKey(BindingType),

    /// Prefetch must fit the AMQP QoS field
    #[error("subscriber_config.prefetch_count `{0}` is out of range, expected 0..=65535")]
    PrefetchOutOfRange(i32),
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish to exchange `{0}`")]
    PublishingError(String),

    /// Error declaring a consumer on a queue
    #[error("failure to declare consumer for queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error pulling a delivery off the consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error closing the channel or the connection
    #[error("failure to close session")]
    CloseError,
}

/// Failure reported by a user message handler.
///
/// Always resolves the delivery to a reject; never escalated.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an underlying error, keeping it reachable through `source()`.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        HandlerError {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Errors returned by the broker facade, publisher and subscriber.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] AmqpError),

    /// Payload could not be encoded to, or decoded from, JSON
    #[error("failure to serialize payload: {0}")]
    Serialization(String),

    /// Configuration could not be loaded from its sources
    #[error("failure to load configuration: {0}")]
    Config(String),

    #[error("broker was not set up as a publisher")]
    NotPublisher,

    #[error("broker was not set up as a subscriber")]
    NotSubscriber,
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<::config::ConfigError> for BrokerError {
    fn from(err: ::config::ConfigError) -> Self {
        BrokerError::Config(err.to_string())
    }
}
