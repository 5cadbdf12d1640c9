// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Reporting
//!
//! The publisher, the subscriber and the broker facade report setup failures and
//! per-delivery errors through an injected [`Reporter`]. Nothing is reported
//! through process-wide state, and no report ever terminates the process.

use std::{error::Error, sync::Arc};
use tracing::{debug, error, info, warn};

/// Sink for the events the broker client produces.
///
/// Implementations are shared across delivery tasks and must be thread-safe.
pub trait Reporter: Send + Sync {
    fn report_error(&self, err: &dyn Error, message: &str);

    fn report_warning(&self, err: Option<&dyn Error>, message: &str);

    fn report_info(&self, message: &str);

    fn report_verbose(&self, message: &str);
}

/// Default reporter, forwarding every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl TracingReporter {
    pub fn shared() -> Arc<dyn Reporter> {
        Arc::new(TracingReporter)
    }
}

impl Reporter for TracingReporter {
    fn report_error(&self, err: &dyn Error, message: &str) {
        error!(error = err.to_string(), "{}", message);
    }

    fn report_warning(&self, err: Option<&dyn Error>, message: &str) {
        match err {
            Some(err) => warn!(error = err.to_string(), "{}", message),
            None => warn!("{}", message),
        }
    }

    fn report_info(&self, message: &str) {
        info!("{}", message);
    }

    fn report_verbose(&self, message: &str) {
        debug!("{}", message);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Reporter that keeps every event in memory for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingReporter {
        pub(crate) errors: Mutex<Vec<String>>,
        pub(crate) warnings: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        pub(crate) fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }

        pub(crate) fn warnings(&self) -> Vec<String> {
            self.warnings.lock().unwrap().clone()
        }
    }

    impl Reporter for RecordingReporter {
        fn report_error(&self, err: &dyn Error, message: &str) {
            self.errors
                .lock()
                .unwrap()
                .push(format!("{}: {}", message, err));
        }

        fn report_warning(&self, _err: Option<&dyn Error>, message: &str) {
            self.warnings.lock().unwrap().push(message.to_owned());
        }

        fn report_info(&self, _message: &str) {}

        fn report_verbose(&self, _message: &str) {}
    }
}
