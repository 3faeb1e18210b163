// Delivery client for the legacy binary push gateway.
//
// A batch flows through one engine: notifications get sequence ids, frames are
// pre-encoded, and each segment of the batch runs on a fresh pooled
// connection with one writer task and one error-reader task. Connections are
// never reused after a segment; the gateway signals failure by writing a
// single error response and hanging up, so a clean reconnect is the only
// safe continuation.
#[macro_use]
mod macros;

pub mod client;
pub mod config;
pub mod counters;
pub mod engine;
pub mod feedback;
pub mod notification;
pub mod pool;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

pub use client::Client;
pub use config::ClientConfig;
pub use counters::{DeliveryCountersSnapshot, delivery_counters_snapshot};
pub use courier_transport::{Credentials, Endpoint};
pub use courier_wire::{DeviceToken, ErrorStatus, FeedbackRecord};
pub use engine::{DeliveryEngine, DeliveryReport, FailedNotification};
pub use feedback::FeedbackReader;
pub use notification::{Alert, DeliveryState, Notification};
pub use pool::ConnectionPool;

use courier_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Wire(#[from] courier_wire::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("gateway rejected notification {identifier}: {status}")]
    Rejected { status: ErrorStatus, identifier: u32 },
    #[error("could not open a connection after {attempts} attempts: {source}")]
    PoolExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    /// The batch stopped early. `report` accounts for everything handled
    /// before the fatal error; the rest stay pending.
    #[error("batch aborted with {} notifications accounted for: {source}", .report.total())]
    Aborted {
        report: DeliveryReport,
        #[source]
        source: Box<ClientError>,
    },
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Callback invoked for every recovered failure inside a batch.
pub type ErrorHook = Arc<dyn Fn(&ClientError) + Send + Sync>;

pub(crate) fn notify_hook(hook: Option<&ErrorHook>, err: &ClientError) {
    if let Some(hook) = hook {
        hook(err);
    }
}
