// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Session
//!
//! This module owns the AMQP connection and the single channel multiplexed over it,
//! and implements the [`Transport`] trait on top of lapin. lapin channels are
//! internally synchronized, so one session can be shared by concurrent publishers
//! and by every delivery task acknowledging its delivery.

use crate::{
    config::Config,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Envelope,
    queue::{QueueBinding, QueueDefinition},
    transport::{Delivery, DeliveryStream, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// AMQP delivery mode marking a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reply code sent when closing the channel and the connection
const REPLY_SUCCESS: u16 = 200;

/// A connection to RabbitMQ and the channel used for every operation.
pub struct AmqpSession {
    conn: Arc<Connection>,
    channel: Arc<Channel>,
}

impl AmqpSession {
    /// Connects to RabbitMQ and opens a channel.
    ///
    /// The URI is built from the configuration, using the normalized virtual host.
    /// The configuration is expected to be validated already.
    pub async fn connect(cfg: &Config) -> Result<AmqpSession, AmqpError> {
        let (conn, channel) = new_amqp_channel(cfg).await?;
        Ok(AmqpSession { conn, channel })
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }
}

/// Creates a new AMQP connection and channel.
pub async fn new_amqp_channel(
    cfg: &Config,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let mut options = ConnectionProperties::default();
    if let Some(name) = &cfg.connection_name {
        options = options.with_connection_name(LongString::from(name.clone()));
    }

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), host = cfg.host.as_str(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

#[async_trait]
impl Transport for AmqpSession {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name().as_str());
                Ok(queue.name().as_str().to_owned())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(count, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                body,
                amqp_properties(envelope),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let stream = consumer.map(|result| match result {
            Ok(delivery) => Ok(Box::new(AmqpDelivery::new(delivery)) as Box<dyn Delivery>),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp channel and connection...");
        let channel = self.channel.close(REPLY_SUCCESS, "OK").await;
        let conn = self.conn.close(REPLY_SUCCESS, "OK").await;

        match channel.and(conn) {
            Err(err) => {
                error!(error = err.to_string(), "error to close the session");
                Err(AmqpError::CloseError)
            }
            _ => Ok(()),
        }
    }
}

/// A lapin delivery together with its decoded envelope.
struct AmqpDelivery {
    inner: lapin::message::Delivery,
    envelope: Envelope,
}

impl AmqpDelivery {
    fn new(inner: lapin::message::Delivery) -> Self {
        let envelope = envelope_from_properties(&inner.properties);
        AmqpDelivery { inner, envelope }
    }
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), AmqpError> {
        match self.inner.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), AmqpError> {
        match self
            .inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// Maps an envelope onto AMQP basic properties.
fn amqp_properties(envelope: &Envelope) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = envelope
        .headers
        .iter()
        .map(|(k, v)| {
            (
                ShortString::from(k.clone()),
                AMQPValue::LongString(LongString::from(v.clone())),
            )
        })
        .collect();

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(envelope.content_type.clone()))
        .with_correlation_id(ShortString::from(envelope.correlation_id.clone()))
        .with_message_id(ShortString::from(envelope.message_id.clone()))
        .with_headers(FieldTable::from(headers));

    if let Some(ts) = envelope.timestamp_secs() {
        props = props.with_timestamp(ts);
    }

    if envelope.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    props
}

/// Reads the envelope back from AMQP basic properties.
fn envelope_from_properties(props: &AMQPProperties) -> Envelope {
    let headers = match props.headers() {
        Some(table) => table
            .inner()
            .iter()
            .filter_map(|(k, v)| match v {
                AMQPValue::LongString(v) => Some((
                    k.as_str().to_owned(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )),
                AMQPValue::ShortString(v) => Some((k.as_str().to_owned(), v.as_str().to_owned())),
                _ => None,
            })
            .collect(),
        None => BTreeMap::new(),
    };

    Envelope {
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|v| v.as_str().to_owned())
            .unwrap_or_default(),
        message_id: props
            .message_id()
            .as_ref()
            .map(|v| v.as_str().to_owned())
            .unwrap_or_default(),
        timestamp: None,
        content_type: props
            .content_type()
            .as_ref()
            .map(|v| v.as_str().to_owned())
            .unwrap_or_default(),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
    .with_timestamp_secs(*props.timestamp())
}
