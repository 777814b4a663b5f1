//! Quote-shape strategies.
//!
//! Each quoting mode maps to exactly one [`QuotingStyle`]. A style turns the
//! filtered market, fair value, parameters and position into an unrounded
//! [`RawQuote`]; the engine applies every risk adjustment afterwards.

pub mod mid_market;
pub mod ping_pong;
pub mod top_join;

pub use mid_market::MidMarketStyle;
pub use ping_pong::PingPongStyle;
pub use top_join::TopOfBookStyle;

use super::{
    config::{QuotingMode, QuotingParameters},
    types::{FairValue, Market, MarketLevel, PositionReport, RawQuote},
};
use crate::errors::{QuotingError, Result};
use std::collections::HashMap;

/// Book depth (levels per side) below which top-of-book styles quote off fair value instead.
pub const DEFAULT_MIN_BOOK_LEVELS: usize = 1;

#[derive(Clone, Debug, PartialEq)]
pub enum QuotingStyle {
    MidMarket(MidMarketStyle),
    TopOfBook(TopOfBookStyle),
    PingPong(PingPongStyle),
}

impl QuotingStyle {
    pub fn mode(&self) -> QuotingMode {
        match self {
            QuotingStyle::MidMarket(_) => QuotingMode::Mid,
            QuotingStyle::TopOfBook(style) => style.mode(),
            QuotingStyle::PingPong(style) => style.mode(),
        }
    }

    /// Returns `None` when no quote can be produced from these inputs.
    pub fn generate_quote(
        &self,
        market: &Market,
        fv: &FairValue,
        params: &QuotingParameters,
        position: &PositionReport,
    ) -> Option<RawQuote> {
        match self {
            QuotingStyle::MidMarket(style) => style.generate_quote(fv, params, position),
            QuotingStyle::TopOfBook(style) => style.generate_quote(market, fv, params, position),
            QuotingStyle::PingPong(style) => style.generate_quote(market, fv, params, position),
        }
    }
}

/// Fixed mode → style table built once at construction.
#[derive(Clone, Debug)]
pub struct QuotingStyleRegistry {
    styles: HashMap<QuotingMode, QuotingStyle>,
}

impl QuotingStyleRegistry {
    pub fn new(styles: impl IntoIterator<Item = QuotingStyle>) -> Self {
        let styles = styles
            .into_iter()
            .map(|style| (style.mode(), style))
            .collect();
        Self { styles }
    }

    pub fn get(&self, mode: QuotingMode) -> Result<&QuotingStyle> {
        self.styles
            .get(&mode)
            .ok_or(QuotingError::UnregisteredMode(mode))
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }
}

impl Default for QuotingStyleRegistry {
    fn default() -> Self {
        Self::new([
            QuotingStyle::MidMarket(MidMarketStyle),
            QuotingStyle::TopOfBook(TopOfBookStyle::inverse_join()),
            QuotingStyle::TopOfBook(TopOfBookStyle::inverse_top()),
            QuotingStyle::TopOfBook(TopOfBookStyle::join()),
            QuotingStyle::TopOfBook(TopOfBookStyle::top()),
            QuotingStyle::PingPong(PingPongStyle::ping_pong()),
            QuotingStyle::PingPong(PingPongStyle::boomerang()),
            QuotingStyle::PingPong(PingPongStyle::ak47()),
        ])
    }
}

/// Best bid/ask levels a top-of-book style anchors on.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TopOfMarket {
    pub bid: MarketLevel,
    pub ask: MarketLevel,
}

/// Picks the best level whose size exceeds `step_over_size`, else the level behind it.
pub(crate) fn top_of_market(market: &Market, params: &QuotingParameters) -> Option<TopOfMarket> {
    Some(TopOfMarket {
        bid: step_over(&market.bids, params.step_over_size)?,
        ask: step_over(&market.asks, params.step_over_size)?,
    })
}

fn step_over(levels: &[MarketLevel], step_over_size: f64) -> Option<MarketLevel> {
    let best = *levels.first()?;
    if best.size > step_over_size {
        return Some(best);
    }
    Some(levels.get(1).copied().unwrap_or(best))
}

pub(crate) fn book_is_thin(market: &Market, min_levels: usize) -> bool {
    let min_levels = min_levels.max(1);
    market.bids.len() < min_levels || market.asks.len() < min_levels
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;

    pub fn position(base: f64, quote: f64) -> PositionReport {
        PositionReport {
            base_amount: base,
            quote_amount: quote,
            base_held_amount: 0.0,
            quote_held_amount: 0.0,
            value: base + quote / 100.0,
            quote_value: base * 100.0 + quote,
            time: Utc::now(),
        }
    }

    pub fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> Market {
        Market::new(
            bids.iter().map(|(p, s)| MarketLevel::new(*p, *s)).collect(),
            asks.iter().map(|(p, s)| MarketLevel::new(*p, *s)).collect(),
            Utc::now(),
        )
    }

    pub fn fair(price: f64) -> FairValue {
        FairValue::new(price, Utc::now())
    }
}
