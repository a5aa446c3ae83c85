//! Remote control commands
//!
//! - [`command`] - Decoding and normalization of command payloads
//! - [`arguments`] - Typed parameters per command
//! - [`router`] - The acknowledge/dispatch/report protocol

pub mod arguments;
pub mod command;
pub mod router;

pub use arguments::{BrokerUrlArgs, FlagArgs, PasswordArgs, PublishArgs, TopicsArgs, UsernameArgs};
pub use command::{control_subscription, CommandEnvelope, ControlCommand, HelperParams};
pub use router::{completion_report, CommandHandlers, CommandName, ControlChannel, ControlRouter};
