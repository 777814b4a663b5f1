pub mod errors;
pub mod quoting;
pub(crate) mod timings;

pub use errors::{QuotingError, Result};
pub use quoting::{
    QuotingEngine, QuotingEvent, QuotingHandle, QuotingMode, QuotingParameters, QuotingRuntime,
    QuotingSender, SafetyCalculator, Trade, TradeSafety, TwoSidedQuote,
};
