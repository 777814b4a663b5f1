use thiserror::Error;

use crate::quoting::config::QuotingMode;

pub type Result<T> = std::result::Result<T, QuotingError>;

/// Contract violations raised by the quoting core.
///
/// Missing inputs (no fair value, no market, no safety snapshot, ...) are not
/// errors; they resolve to "no quote" and recover on the next trigger.
#[derive(Debug, Error)]
pub enum QuotingError {
    #[error("no quoting style registered for mode {0:?}")]
    UnregisteredMode(QuotingMode),
    #[error("unknown liquidity code {0:?}")]
    UnknownLiquidity(String),
    #[error("unknown side {0:?}")]
    UnknownSide(String),
    #[error("malformed trade {trade_id}: {reason}")]
    MalformedTrade { trade_id: String, reason: String },
    #[error("quoting runtime is shut down")]
    RuntimeClosed,
}

impl QuotingError {
    pub fn malformed_trade(trade_id: &str, reason: impl Into<String>) -> Self {
        QuotingError::MalformedTrade {
            trade_id: trade_id.to_string(),
            reason: reason.into(),
        }
    }
}
