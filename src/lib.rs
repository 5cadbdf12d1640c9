// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker Client
//!
//! Publish/subscribe over AMQP with a declarative topology configuration:
//!
//! - [`config`] and [`validation`]: what to declare, checked before anything is dialed
//! - [`publisher`]: JSON messages with their envelope and trace context
//! - [`subscriber`]: one task per delivery, each resolved to exactly one ack or nack
//! - [`broker`]: the facade building either role, or both, over one session
//! - [`transport`]: the broker boundary, implemented by [`channel`] (lapin) and [`memory`]

mod consumer;
mod otel;

pub mod binding;
pub mod broker;
pub mod channel;
pub mod config;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod reporter;
pub mod subscriber;
pub mod transport;
pub mod validation;

pub use binding::BindingType;
pub use broker::MessageBroker;
pub use config::{load_config, Config, DecodeFailurePolicy, PublisherConfig, SubscriberConfig};
pub use errors::{AmqpError, BrokerError, HandlerError, ValidationError};
pub use handler::MessageHandler;
pub use message::{DistributedMessage, DistributedPayload};
pub use reporter::{Reporter, TracingReporter};
