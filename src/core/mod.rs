//! Core relay.
//!
//! - `relay`: the publish pipeline, endpoint routing and observability queries
//! - `subscriptions`: in-memory subscriber fan-out

pub mod relay;
pub mod subscriptions;

pub use relay::{
    PublishOptions, PublishResult, RelayCore, RelayMetrics, RelayOptions, REASON_EXPIRED,
    REASON_UNROUTABLE,
};
pub use subscriptions::{handler, Handler, Subscription, Subscriptions};
