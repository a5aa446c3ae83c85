//! Observability for the bridge runtime
//!
//! Structured logging through `tracing`, with span macros for the long-lived
//! loops (lifecycle, subscriptions, broker, command routing).

pub mod logging;

pub use logging::{init_default_logging, init_logging, init_logging_with_verbosity, LogFormat};

// Span macros for structured logging
pub use logging::{bridge_span, control_span, mqtt_span, subscription_span};
