//! Webhook dispatcher
//!
//! Lifecycle events fan out to subscriptions with HMAC-signed payloads.
//! Deliveries are FIFO per subscription with a bounded queue; attempts
//! retry with exponential backoff and end in a dead record after the last
//! failure. Sentiment alerts are rate-limited per call.

mod dispatcher;
mod signature;

pub use dispatcher::{
    AttemptOutcome, DeliveryLog, DeliveryRecord, Dispatcher, DispatcherConfig, HttpTransport,
    SentimentAlertLimiter, Subscription, WebhookTransport,
};
pub use signature::{sign, verify, SIGNATURE_HEADER};
