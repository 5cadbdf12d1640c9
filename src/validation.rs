// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration Validation
//!
//! Pure, fail-fast checks over the configuration tree. Checks run in a fixed
//! order and the first violation is returned; nothing here touches the network.

use crate::{
    binding::BindingType,
    config::{Config, PublisherConfig, SubscriberConfig},
    errors::ValidationError,
};

/// Validates the shared connection settings, then the role configuration.
///
/// When both roles are configured only the subscriber configuration is checked;
/// the publisher configuration is checked on its own when it is the only role.
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    non_empty(&config.username, "username")?;
    non_empty(&config.password, "password")?;
    non_empty(&config.host, "host")?;
    // "/" passes here and is mapped to the default vhost by `Config::vhost`
    non_empty(&config.virtual_host, "virtual_host")?;

    match (&config.subscriber_config, &config.publisher_config) {
        (None, None) => Err(ValidationError::MissingRole),
        (Some(sub), _) => validate_subscriber(sub),
        (None, Some(publisher)) => validate_publisher(publisher),
    }
}

/// Validates a subscriber configuration on its own.
pub fn validate_subscriber(config: &SubscriberConfig) -> Result<(), ValidationError> {
    if config.strict_queue_name {
        non_empty(&config.queue_name, "subscriber_config.queue_name")?;
    }
    non_empty(&config.exchange_name, "subscriber_config.exchange_name")?;

    let kind = BindingType::try_from(config.binding_type)?;
    if kind.requires_routing_key() && config.routing_key.is_empty() {
        return Err(ValidationError::MissingRoutingKey(kind));
    }

    if !(0..=i32::from(u16::MAX)).contains(&config.prefetch_count) {
        return Err(ValidationError::PrefetchOutOfRange(config.prefetch_count));
    }

    Ok(())
}

/// Validates a publisher configuration on its own.
pub fn validate_publisher(config: &PublisherConfig) -> Result<(), ValidationError> {
    non_empty(&config.exchange_name, "publisher_config.exchange_name")?;
    BindingType::try_from(config.binding_type)?;

    Ok(())
}

fn non_empty(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config::new("test", "test", "localhost", "/")
            .subscriber(
                SubscriberConfig::new("test", BindingType::Topic)
                    .queue("test")
                    .routing_key("test.*")
                    .prefetch(100)
                    .durable()
                    .requeue_on_nack(true),
            )
            .publisher(PublisherConfig::new("test", BindingType::Fanout).durable())
    }

    #[test]
    fn test_valid_config() {
        assert_eq!(validate(&valid_config()), Ok(()));
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_each_missing_connection_field_is_named() {
        let cases: [(fn(&mut Config), &str); 4] = [
            (|c| c.username.clear(), "username"),
            (|c| c.password.clear(), "password"),
            (|c| c.host.clear(), "host"),
            (|c| c.virtual_host.clear(), "virtual_host"),
        ];

        for (clear, field) in cases {
            let mut cfg = valid_config();
            clear(&mut cfg);
            assert_eq!(validate(&cfg), Err(ValidationError::EmptyField(field)));
        }
    }

    #[test]
    fn test_first_failure_wins() {
        let mut cfg = valid_config();
        cfg.password.clear();
        cfg.host.clear();
        cfg.subscriber_config = None;
        cfg.publisher_config = None;

        assert_eq!(validate(&cfg), Err(ValidationError::EmptyField("password")));
    }

    #[test]
    fn test_root_vhost_is_valid_and_normalized() {
        let cfg = valid_config();
        assert_eq!(cfg.virtual_host, "/");
        assert_eq!(validate(&cfg), Ok(()));
        assert_eq!(cfg.vhost(), "");
    }

    #[test]
    fn test_missing_role() {
        let cfg = Config::new("test", "test", "localhost", "/");
        assert_eq!(validate(&cfg), Err(ValidationError::MissingRole));
    }

    #[test]
    fn test_publisher_only() {
        let cfg = Config::new("test", "test", "localhost", "/")
            .publisher(PublisherConfig::new("test", BindingType::Topic));
        assert_eq!(validate(&cfg), Ok(()));

        let cfg = Config::new("test", "test", "localhost", "/")
            .publisher(PublisherConfig::new("", BindingType::Topic));
        assert_eq!(
            validate(&cfg),
            Err(ValidationError::EmptyField("publisher_config.exchange_name"))
        );
    }

    #[test]
    fn test_subscriber_shadows_publisher_checks() {
        let mut cfg = valid_config();
        if let Some(publisher) = cfg.publisher_config.as_mut() {
            publisher.exchange_name.clear();
        }
        assert_eq!(validate(&cfg), Ok(()));
    }

    #[test]
    fn test_strict_queue_name_requires_queue() {
        let mut sub = SubscriberConfig::new("x", BindingType::Fanout);
        sub.strict_queue_name = true;
        assert_eq!(
            validate_subscriber(&sub),
            Err(ValidationError::EmptyField("subscriber_config.queue_name"))
        );

        sub.strict_queue_name = false;
        assert_eq!(validate_subscriber(&sub), Ok(()));
    }

    #[test]
    fn test_subscriber_exchange_required() {
        let sub = SubscriberConfig::new("", BindingType::Fanout);
        assert_eq!(
            sub.validate(),
            Err(ValidationError::EmptyField("subscriber_config.exchange_name"))
        );
    }

    #[test]
    fn test_binding_type_range() {
        for value in [-5, -1, 3, 4, 100] {
            let mut sub = SubscriberConfig::new("x", BindingType::Fanout).routing_key("k");
            sub.binding_type = value;
            assert_eq!(
                validate_subscriber(&sub),
                Err(ValidationError::BindingTypeOutOfRange(value))
            );

            let mut publisher = PublisherConfig::new("x", BindingType::Fanout);
            publisher.binding_type = value;
            assert_eq!(
                validate_publisher(&publisher),
                Err(ValidationError::BindingTypeOutOfRange(value))
            );
        }
    }

    #[test]
    fn test_routing_key_requirement_per_binding_type() {
        let fanout = SubscriberConfig::new("x", BindingType::Fanout);
        assert_eq!(validate_subscriber(&fanout), Ok(()));

        for kind in [BindingType::Direct, BindingType::Topic] {
            let sub = SubscriberConfig::new("x", kind);
            assert_eq!(
                validate_subscriber(&sub),
                Err(ValidationError::MissingRoutingKey(kind))
            );
            assert_eq!(validate_subscriber(&sub.routing_key("orders.*")), Ok(()));
        }
    }

    #[test]
    fn test_prefetch_bounds() {
        let base = SubscriberConfig::new("x", BindingType::Fanout);

        assert_eq!(validate_subscriber(&base.clone().prefetch(0)), Ok(()));
        assert_eq!(validate_subscriber(&base.clone().prefetch(65535)), Ok(()));
        assert_eq!(
            validate_subscriber(&base.clone().prefetch(-1)),
            Err(ValidationError::PrefetchOutOfRange(-1))
        );
        assert_eq!(
            validate_subscriber(&base.prefetch(65536)),
            Err(ValidationError::PrefetchOutOfRange(65536))
        );
    }
}
