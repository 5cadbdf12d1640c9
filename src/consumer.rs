// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Takes one delivery through decode, handling and resolution:
//!
//! 1. Decodes the JSON body into the handler payload
//! 2. Copies correlation id, message id and timestamp from the envelope
//! 3. Calls the handler under a consumer span parented by the propagated context
//! 4. Acknowledges on success, rejects on failure or panic honouring `requeue_on_nack`
//!
//! Every delivery is resolved exactly once and on its own, never in batch.

use crate::{
    config::DecodeFailurePolicy,
    errors::{AmqpError, HandlerError},
    handler::MessageHandler,
    message::DistributedMessage,
    otel,
    reporter::Reporter,
    transport::Delivery,
};
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, Status},
};
use futures_util::FutureExt;
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe};
use tracing::debug;

/// Name of the tracer used for consumer spans
pub(crate) const CONSUMER_TRACER: &str = "amqp subscriber";

/// Per-subscriber resolution policy, shared by every delivery task.
#[derive(Debug, Clone)]
pub(crate) struct DeliveryPolicy {
    pub(crate) queue: String,
    pub(crate) requeue_on_nack: bool,
    pub(crate) decode_failure: DecodeFailurePolicy,
}

/// Terminal state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Acked,
    Rejected { requeue: bool },
}

/// Consumes and resolves one delivery.
///
/// Decode failures, handler failures and handler panics are reported and turned
/// into a reject; only a failure to resolve the delivery itself is returned.
pub(crate) async fn consume<H: MessageHandler>(
    delivery: Box<dyn Delivery>,
    handler: &H,
    policy: &DeliveryPolicy,
    reporter: &dyn Reporter,
) -> Result<Resolution, AmqpError> {
    let tracer = global::tracer(CONSUMER_TRACER);
    let (ctx, mut span) = otel::new_span(&delivery.envelope().headers, &tracer, &policy.queue);

    debug!(
        "received: {} - queue: {}",
        delivery.envelope().message_id,
        policy.queue
    );

    let decoded = serde_json::from_slice::<H::Payload>(delivery.body());
    let data = match decoded {
        Ok(data) => data,
        Err(err) => {
            let fallback = match policy.decode_failure {
                DecodeFailurePolicy::BestEffort => handler.fallback_payload(),
                DecodeFailurePolicy::Reject => None,
            };

            match fallback {
                Some(data) => {
                    reporter.report_warning(
                        Some(&err),
                        "failure to decode message body, handling fallback payload",
                    );
                    data
                }
                None => {
                    reporter
                        .report_error(&err, "failure to decode message body, rejecting message");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("failure to decode message body"),
                    });
                    return reject(delivery, policy.requeue_on_nack, &mut span).await;
                }
            }
        }
    };

    let msg = DistributedMessage::from_envelope(data, delivery.envelope());

    // a panicking handler still resolves its delivery, as a failure
    let outcome = match AssertUnwindSafe(handler.handle(&ctx, msg))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(HandlerError::new(format!(
            "message handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };

    match outcome {
        Ok(()) => {
            debug!("message successfully processed");
            match delivery.ack().await {
                Err(err) => {
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(err)
                }
                _ => {
                    span.set_status(Status::Ok);
                    Ok(Resolution::Acked)
                }
            }
        }
        Err(err) => {
            reporter.report_error(&err, "error whiling handling msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("message handler failed"),
            });
            reject(delivery, policy.requeue_on_nack, &mut span).await
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    match panic.downcast_ref::<&'static str>() {
        Some(msg) => *msg,
        None => panic
            .downcast_ref::<String>()
            .map(String::as_str)
            .unwrap_or("unknown panic payload"),
    }
}

async fn reject(
    delivery: Box<dyn Delivery>,
    requeue: bool,
    span: &mut BoxedSpan,
) -> Result<Resolution, AmqpError> {
    match delivery.nack(requeue).await {
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
            Err(err)
        }
        _ => Ok(Resolution::Rejected { requeue }),
    }
}
