// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Transport
//!
//! A brokerless implementation of [`Transport`]: exchanges route to queues with the
//! same fanout/direct/topic rules RabbitMQ applies, and consumers receive at most
//! `prefetch` unacknowledged deliveries at a time. Nothing is persisted.
//!
//! Differences with a real broker: publishing with `mandatory` to an exchange with
//! no matching binding fails the publish call instead of returning the message
//! asynchronously, and closing any transport shuts the whole broker down.

use crate::{
    binding::{routing_key_matches, BindingType},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Envelope,
    queue::{QueueBinding, QueueDefinition},
    transport::{Delivery, DeliveryStream, Transport},
};
use async_trait::async_trait;
use futures_util::stream;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Counters describing what went through the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub published: usize,
    pub unroutable: usize,
    pub acked: usize,
    pub rejected: usize,
    pub requeued: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    envelope: Envelope,
    body: Vec<u8>,
    redelivered: bool,
}

struct ExchangeState {
    kind: BindingType,
    durable: bool,
}

struct QueueState {
    durable: bool,
    sender: Option<mpsc::UnboundedSender<StoredMessage>>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<StoredMessage>>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    generated: u64,
    closed: bool,
    stats: MemoryStats,
}

/// Shared state of an in-process broker. Cloning gives another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Opens a channel on this broker.
    pub fn channel(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            prefetch: Mutex::new(0),
        }
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Number of messages waiting in a queue, not counting unacknowledged ones.
    ///
    /// Returns `None` for an unknown queue, or while a consumer is waiting on it.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        let receiver = self.lock().queues.get(queue)?.receiver.clone();
        let depth = receiver.try_lock().ok().map(|rx| rx.len());
        depth
    }

    /// Ends every delivery stream once its queue drains; later calls fail.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for queue in state.queues.values_mut() {
            queue.sender = None;
        }
        debug!("memory broker closed");
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn requeue(&self, queue: &str, mut message: StoredMessage) {
        let mut state = self.lock();
        message.redelivered = true;
        let sent = state
            .queues
            .get(queue)
            .and_then(|q| q.sender.as_ref())
            .map(|sender| sender.send(message).is_ok())
            .unwrap_or(false);
        if sent {
            state.stats.requeued += 1;
        }
    }
}

/// A channel on a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    prefetch: Mutex<u16>,
}

impl MemoryTransport {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        if state.closed {
            return Err(AmqpError::ChannelError);
        }

        match state.exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind || existing.durable != def.durable => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    def.name.clone(),
                    ExchangeState {
                        kind: def.kind,
                        durable: def.durable,
                    },
                );
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        let mut state = self.broker.lock();
        if state.closed {
            return Err(AmqpError::ChannelError);
        }

        let name = if def.name.is_empty() {
            if def.strict {
                return Err(AmqpError::DeclareQueueError(def.name.clone()));
            }
            state.generated += 1;
            format!("amq.gen-{}", state.generated)
        } else {
            def.name.clone()
        };

        match state.queues.get(&name) {
            Some(existing) if existing.durable != def.durable => {
                Err(AmqpError::DeclareQueueError(name))
            }
            Some(_) => Ok(name),
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        durable: def.durable,
                        sender: Some(sender),
                        receiver: Arc::new(AsyncMutex::new(receiver)),
                    },
                );
                debug!("queue: {} was created", name);
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        if state.closed
            || !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        *self.prefetch.lock().unwrap_or_else(PoisonError::into_inner) = count;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        envelope: &Envelope,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        if state.closed {
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        }

        let kind = match state.exchanges.get(exchange) {
            Some(ex) => ex.kind,
            None => return Err(AmqpError::PublishingError(exchange.to_owned())),
        };

        // a queue bound several times still receives one copy
        let targets: BTreeSet<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| routing_key_matches(kind, &b.routing_key, routing_key))
            .map(|b| b.queue_name.clone())
            .collect();

        if targets.is_empty() {
            if mandatory {
                return Err(AmqpError::PublishingError(exchange.to_owned()));
            }
            state.stats.unroutable += 1;
            return Ok(());
        }

        let message = StoredMessage {
            envelope: envelope.clone(),
            body: body.to_vec(),
            redelivered: false,
        };
        for target in &targets {
            if let Some(sender) = state.queues.get(target).and_then(|q| q.sender.as_ref()) {
                let _ = sender.send(message.clone());
            }
        }
        state.stats.published += 1;

        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let receiver = {
            let state = self.broker.lock();
            if state.closed {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }
            match state.queues.get(queue) {
                Some(q) => q.receiver.clone(),
                None => return Err(AmqpError::ConsumerDeclarationError(queue.to_owned())),
            }
        };

        let prefetch = *self.prefetch.lock().unwrap_or_else(PoisonError::into_inner);
        let consumer = ConsumerState {
            receiver,
            credit: (prefetch > 0).then(|| Arc::new(Semaphore::new(usize::from(prefetch)))),
            broker: self.broker.clone(),
            queue: queue.to_owned(),
        };

        let deliveries = stream::unfold(consumer, |consumer| async move {
            let permit = match &consumer.credit {
                Some(credit) => Some(credit.clone().acquire_owned().await.ok()?),
                None => None,
            };
            let message = consumer.receiver.lock().await.recv().await?;

            let delivery = MemoryDelivery {
                message,
                broker: consumer.broker.clone(),
                queue: consumer.queue.clone(),
                _permit: permit,
            };
            Some((Ok(Box::new(delivery) as Box<dyn Delivery>), consumer))
        });

        Ok(Box::pin(deliveries))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.close();
        Ok(())
    }
}

struct ConsumerState {
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<StoredMessage>>>,
    credit: Option<Arc<Semaphore>>,
    broker: MemoryBroker,
    queue: String,
}

/// A delivery holding one unit of prefetch credit until it is resolved.
struct MemoryDelivery {
    message: StoredMessage,
    broker: MemoryBroker,
    queue: String,
    _permit: Option<OwnedSemaphorePermit>,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn envelope(&self) -> &Envelope {
        &self.message.envelope
    }

    fn redelivered(&self) -> bool {
        self.message.redelivered
    }

    async fn ack(self: Box<Self>) -> Result<(), AmqpError> {
        self.broker.lock().stats.acked += 1;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), AmqpError> {
        let this = *self;
        this.broker.lock().stats.rejected += 1;
        if requeue {
            this.broker.requeue(&this.queue, this.message);
        }
        Ok(())
    }
}
