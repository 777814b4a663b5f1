//! Quoting decision core for ping/pong market making.
//!
//! Quote shapes come from the per-mode [`styles`], trade-rate protection from
//! [`safety::SafetyCalculator`], and the final risk-adjusted, debounced quote
//! from [`engine::QuotingEngine`]. [`runtime::QuotingRuntime`] wires them to
//! incoming events on a single task.

pub mod config;
pub mod engine;
pub mod events;
pub mod runtime;
pub mod safety;
pub mod styles;
pub mod types;

pub use config::{QuotingMode, QuotingParameters};
pub use engine::QuotingEngine;
pub use runtime::{QuotingEvent, QuotingHandle, QuotingRuntime, QuotingSender};
pub use safety::SafetyCalculator;
pub use styles::{QuotingStyle, QuotingStyleRegistry};
pub use types::{Quote, Trade, TradeSafety, TwoSidedQuote};
