// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Distributed Messages
//!
//! A message is an opaque JSON payload plus envelope metadata (correlation id,
//! message id, timestamp). The payload travels in the body; the metadata travels
//! in the delivery properties and is never re-derived from the body.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type attached to every published body
pub const JSON_CONTENT_TYPE: &str = "text/json";

/// Delivery metadata carried outside of the message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub correlation_id: String,
    pub message_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub content_type: String,
    /// Persistent delivery mode, the message survives a broker restart once queued
    pub persistent: bool,
    /// Free-form string headers; used for trace context propagation
    pub headers: BTreeMap<String, String>,
}

/// Capabilities a value needs to be published.
///
/// Anything implementing this trait can be handed to a publisher; the data is
/// encoded as JSON and the remaining accessors fill the envelope.
pub trait DistributedPayload: Send + Sync {
    type Data: Serialize;

    fn data(&self) -> &Self::Data;

    fn timestamp(&self) -> DateTime<Utc>;

    fn message_id(&self) -> String;

    fn correlation_id(&self) -> String;
}

/// A payload together with its envelope identifiers.
///
/// Handlers receive one of these per delivery, with the identifiers copied from
/// the delivery envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedMessage<T> {
    pub data: T,
    pub timestamp: Option<DateTime<Utc>>,
    pub message_id: String,
    pub correlation_id: String,
}

impl<T> DistributedMessage<T> {
    /// Wraps `data` with a fresh message id, the current time and an empty correlation id.
    pub fn new(data: T) -> Self {
        DistributedMessage {
            data,
            timestamp: Some(Utc::now()),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: String::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = id.to_owned();
        self
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = id.to_owned();
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Rebuilds a consumed message: the envelope overrides whatever the body said.
    pub(crate) fn from_envelope(data: T, envelope: &Envelope) -> Self {
        DistributedMessage {
            data,
            timestamp: envelope.timestamp,
            message_id: envelope.message_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
        }
    }
}

impl<T> DistributedPayload for DistributedMessage<T>
where
    T: Serialize + Send + Sync,
{
    type Data = T;

    fn data(&self) -> &T {
        &self.data
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp.unwrap_or_else(Utc::now)
    }

    fn message_id(&self) -> String {
        self.message_id.clone()
    }

    fn correlation_id(&self) -> String {
        self.correlation_id.clone()
    }
}

impl Envelope {
    /// Builds the envelope a publisher attaches to a payload.
    pub fn for_payload<P: DistributedPayload + ?Sized>(payload: &P) -> Self {
        Envelope {
            correlation_id: payload.correlation_id(),
            message_id: payload.message_id(),
            timestamp: Some(payload.timestamp()),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            persistent: true,
            headers: BTreeMap::new(),
        }
    }

    /// Timestamp in whole seconds, as AMQP carries it.
    pub fn timestamp_secs(&self) -> Option<u64> {
        self.timestamp.map(|ts| ts.timestamp().max(0) as u64)
    }

    pub fn with_timestamp_secs(mut self, secs: Option<u64>) -> Self {
        self.timestamp = secs.and_then(|s| DateTime::from_timestamp(s as i64, 0));
        self
    }
}
