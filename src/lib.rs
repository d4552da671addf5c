//! agent-relay library root.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod runtime;
pub mod store;

pub use adapters::{RelayAdapter, RelayPublisher};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{PublishOptions, PublishResult, RelayCore, RelayOptions};
pub use error::{Error, Result};
pub use protocol::{Envelope, EnvelopeBuilder, PublishKind};
