// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Types
//!
//! The routing discipline an exchange applies, and the queue bindings made against it.
//! Configuration carries the binding type as an integer so that out-of-range values
//! surface as validation errors instead of deserialization failures.

use crate::errors::ValidationError;
use std::fmt;

/// Routing semantics of an exchange.
///
/// - Fanout: broadcasts messages to every bound queue, routing keys are ignored
/// - Direct: routes on an exact match of the routing key
/// - Topic: routes on a wildcard pattern match of the routing key (`*` one word, `#` zero or more)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BindingType {
    #[default]
    Fanout = 0,
    Direct = 1,
    Topic = 2,
}

impl BindingType {
    /// Whether queues bound with this type need a routing key.
    pub fn requires_routing_key(self) -> bool {
        matches!(self, BindingType::Direct | BindingType::Topic)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BindingType::Fanout => "fanout",
            BindingType::Direct => "direct",
            BindingType::Topic => "topic",
        }
    }
}

impl TryFrom<i32> for BindingType {
    type Error = ValidationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BindingType::Fanout),
            1 => Ok(BindingType::Direct),
            2 => Ok(BindingType::Topic),
            other => Err(ValidationError::BindingTypeOutOfRange(other)),
        }
    }
}

impl From<BindingType> for i32 {
    fn from(value: BindingType) -> Self {
        value as i32
    }
}

impl From<BindingType> for lapin::ExchangeKind {
    fn from(value: BindingType) -> Self {
        match value {
            BindingType::Fanout => lapin::ExchangeKind::Fanout,
            BindingType::Direct => lapin::ExchangeKind::Direct,
            BindingType::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Matches a published routing key against a binding key.
///
/// Words are separated by `.`; for topic bindings `*` matches exactly one word and
/// `#` matches zero or more words. Fanout ignores keys entirely.
pub fn routing_key_matches(kind: BindingType, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        BindingType::Fanout => true,
        BindingType::Direct => binding_key == routing_key,
        BindingType::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&head, rest)) => match words.split_first() {
            Some((word, remaining)) if head == "*" || head == *word => {
                topic_matches(rest, remaining)
            }
            _ => false,
        },
    }
}
