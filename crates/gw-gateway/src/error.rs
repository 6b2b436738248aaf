//! Gateway error types

use std::time::Duration;
use thiserror::Error;

use gw_common::PublishOutcome;
use crate::broker::BrokerError;
use crate::pool::PoolError;
use crate::tag::TagError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Publish throttled for {key}")]
    Throttled { key: String },

    #[error("No broker connection available within {0:?}")]
    PoolExhausted(Duration),

    #[error("Broker pool is closed")]
    PoolClosed,

    #[error("Broker connect failed after {elapsed:?}: {source}")]
    FactoryError {
        elapsed: Duration,
        #[source]
        source: BrokerError,
    },

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] TagError),

    #[error("Broker write failed: {0}")]
    BrokerWriteError(#[source] BrokerError),

    #[error("Message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl GatewayError {
    /// Stable code used in responses and audit lines
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Throttled { .. } => "throttled",
            GatewayError::PoolExhausted(_) => "pool_exhausted",
            GatewayError::PoolClosed => "pool_closed",
            GatewayError::FactoryError { .. } => "connect_failed",
            GatewayError::MalformedEnvelope(_) => "malformed_envelope",
            GatewayError::BrokerWriteError(_) => "broker_write_failed",
            GatewayError::MessageTooLarge { .. } => "message_too_large",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::ShuttingDown => "shutting_down",
        }
    }

    pub fn outcome(&self) -> PublishOutcome {
        match self {
            GatewayError::Throttled { .. } => PublishOutcome::Throttled,
            GatewayError::PoolExhausted(_) => PublishOutcome::PoolExhausted,
            GatewayError::PoolClosed | GatewayError::ShuttingDown => PublishOutcome::PoolClosed,
            GatewayError::FactoryError { .. } => PublishOutcome::ConnectFailed,
            GatewayError::BrokerWriteError(_) => PublishOutcome::BrokerWriteFailed,
            GatewayError::MalformedEnvelope(_)
            | GatewayError::MessageTooLarge { .. }
            | GatewayError::InvalidRequest(_) => PublishOutcome::Rejected,
        }
    }

    /// True for load-shedding rejections, as opposed to infrastructure failures
    pub fn is_backpressure(&self) -> bool {
        matches!(self, GatewayError::Throttled { .. } | GatewayError::PoolExhausted(_))
    }
}

impl From<PoolError<BrokerError>> for GatewayError {
    fn from(err: PoolError<BrokerError>) -> Self {
        match err {
            PoolError::Exhausted(timeout) => GatewayError::PoolExhausted(timeout),
            PoolError::Closed => GatewayError::PoolClosed,
            PoolError::Factory { elapsed, source } => GatewayError::FactoryError { elapsed, source },
        }
    }
}
