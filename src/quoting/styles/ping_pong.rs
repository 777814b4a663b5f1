use super::{book_is_thin, top_of_market, MidMarketStyle, DEFAULT_MIN_BOOK_LEVELS};
use crate::quoting::{
    config::{QuotingMode, QuotingParameters},
    types::{FairValue, Market, PositionReport, RawQuote},
};

/// PingPong, Boomerang and AK47 share one quote shape: the best book levels,
/// kept at least half a ping width away from fair value. They differ only in
/// how the engine and safety calculator treat pongs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PingPongStyle {
    mode: QuotingMode,
    min_book_levels: usize,
}

impl PingPongStyle {
    fn new(mode: QuotingMode) -> Self {
        Self {
            mode,
            min_book_levels: DEFAULT_MIN_BOOK_LEVELS,
        }
    }

    pub fn ping_pong() -> Self {
        Self::new(QuotingMode::PingPong)
    }

    pub fn boomerang() -> Self {
        Self::new(QuotingMode::Boomerang)
    }

    pub fn ak47() -> Self {
        Self::new(QuotingMode::Ak47)
    }

    pub fn with_min_book_levels(mut self, levels: usize) -> Self {
        self.min_book_levels = levels;
        self
    }

    pub fn mode(&self) -> QuotingMode {
        self.mode
    }

    pub fn generate_quote(
        &self,
        market: &Market,
        fv: &FairValue,
        params: &QuotingParameters,
        position: &PositionReport,
    ) -> Option<RawQuote> {
        if book_is_thin(market, self.min_book_levels) {
            return MidMarketStyle.generate_quote(fv, params, position);
        }
        let top = top_of_market(market, params)?;
        let half_width = params.width_ping / 2.0;
        Some(RawQuote::new(
            top.bid.price.min(fv.price - half_width),
            params.buy_size_for(Some(position)),
            top.ask.price.max(fv.price + half_width),
            params.sell_size_for(Some(position)),
        ))
    }
}
