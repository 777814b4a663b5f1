use super::{book_is_thin, top_of_market, MidMarketStyle, DEFAULT_MIN_BOOK_LEVELS};
use crate::quoting::{
    config::{QuotingMode, QuotingParameters, QUOTE_TICK},
    types::{FairValue, Market, PositionReport, RawQuote},
};

/// Default top-of-book size above which Top/InverseTop step inside the best level.
pub const TOP_STEP_SIZE_THRESHOLD: f64 = 0.2;

/// Join, Top, InverseJoin and InverseTop: quotes anchored on the best book levels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TopOfBookStyle {
    mode: QuotingMode,
    min_book_levels: usize,
    join_increment: f64,
    step_size_threshold: f64,
}

impl TopOfBookStyle {
    fn new(mode: QuotingMode) -> Self {
        Self {
            mode,
            min_book_levels: DEFAULT_MIN_BOOK_LEVELS,
            join_increment: QUOTE_TICK,
            step_size_threshold: TOP_STEP_SIZE_THRESHOLD,
        }
    }

    pub fn join() -> Self {
        Self::new(QuotingMode::Join)
    }

    pub fn top() -> Self {
        Self::new(QuotingMode::Top)
    }

    pub fn inverse_join() -> Self {
        Self::new(QuotingMode::InverseJoin)
    }

    pub fn inverse_top() -> Self {
        Self::new(QuotingMode::InverseTop)
    }

    pub fn with_min_book_levels(mut self, levels: usize) -> Self {
        self.min_book_levels = levels;
        self
    }

    /// Price step Top/InverseTop take inside the best level. Defaults to one tick.
    pub fn with_join_increment(mut self, increment: f64) -> Self {
        self.join_increment = increment;
        self
    }

    pub fn with_step_size_threshold(mut self, size: f64) -> Self {
        self.step_size_threshold = size;
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
        let mut bid_px = top.bid.price;
        let mut ask_px = top.ask.price;
        let step_inside = matches!(self.mode, QuotingMode::Top | QuotingMode::InverseTop);

        match self.mode {
            QuotingMode::InverseJoin | QuotingMode::InverseTop => {
                let market_width = (ask_px - bid_px).abs();
                if market_width > params.width_ping {
                    ask_px += params.width_ping;
                    bid_px -= params.width_ping;
                }
                if step_inside {
                    if top.bid.size > self.step_size_threshold {
                        bid_px += self.join_increment;
                    }
                    if top.ask.size > self.step_size_threshold {
                        ask_px -= self.join_increment;
                    }
                }
                if market_width < 2.0 * params.width_ping / 3.0 {
                    ask_px += params.width_ping / 4.0;
                    bid_px -= params.width_ping / 4.0;
                }
            }
            _ => {
                if step_inside && top.bid.size > self.step_size_threshold {
                    bid_px += self.join_increment;
                }
                bid_px = bid_px.min(fv.price - params.width_ping / 2.0);
                if step_inside && top.ask.size > self.step_size_threshold {
                    ask_px -= self.join_increment;
                }
                ask_px = ask_px.max(fv.price + params.width_ping / 2.0);
            }
        }

        Some(RawQuote::new(
            bid_px,
            params.buy_size_for(Some(position)),
            ask_px,
            params.sell_size_for(Some(position)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quoting::styles::test_support::{book, fair, position};

    fn params() -> QuotingParameters {
        QuotingParameters {
            width_ping: 0.2,
            step_over_size: 1.0,
            ..QuotingParameters::default()
        }
    }

    fn quote(style: TopOfBookStyle, market: &Market) -> (f64, f64) {
        let raw = style
            .generate_quote(market, &fair(100.0), &params(), &position(1.0, 100.0))
            .unwrap();
        (raw.bid_px.unwrap(), raw.ask_px.unwrap())
    }

    fn assert_close(actual: (f64, f64), expected: (f64, f64)) {
        assert!(
            (actual.0 - expected.0).abs() < 1e-9 && (actual.1 - expected.1).abs() < 1e-9,
            "expected {:?}, got {:?}",
            expected,
            actual
        );
    }

    #[test]
    fn test_join_wide_book() {
        let market = book(&[(99.5, 1.5)], &[(100.5, 1.5)]);
        assert_close(quote(TopOfBookStyle::join(), &market), (99.5, 100.5));
        assert_close(quote(TopOfBookStyle::top(), &market), (99.51, 100.49));
    }

    #[test]
    fn test_join_never_inside_ping_width() {
        let market = book(&[(99.95, 1.5)], &[(100.05, 1.5)]);
        assert_close(quote(TopOfBookStyle::join(), &market), (99.9, 100.1));
    }

    #[test]
    fn test_inverse_join_widens() {
        let wide = book(&[(99.5, 1.5)], &[(100.5, 1.5)]);
        assert_close(quote(TopOfBookStyle::inverse_join(), &wide), (99.3, 100.7));
        assert_close(quote(TopOfBookStyle::inverse_top(), &wide), (99.31, 100.69));

        let narrow = book(&[(99.99, 1.5)], &[(100.01, 1.5)]);
        assert_close(quote(TopOfBookStyle::inverse_join(), &narrow), (99.94, 100.06));
    }

    #[test]
    fn test_configurable_step_inside() {
        let market = book(&[(99.5, 1.5)], &[(100.5, 1.5)]);
        let coarse = TopOfBookStyle::top().with_join_increment(0.05);
        assert_close(quote(coarse, &market), (99.55, 100.45));

        let picky = TopOfBookStyle::top().with_step_size_threshold(2.0);
        assert_close(quote(picky, &market), (99.5, 100.5));

        let inverse = TopOfBookStyle::inverse_top().with_join_increment(0.1);
        assert_close(quote(inverse, &market), (99.4, 100.6));
    }

    #[test]
    fn test_thin_book_falls_back_to_mid_market() {
        let empty = book(&[], &[]);
        assert_close(quote(TopOfBookStyle::join(), &empty), (99.9, 100.1));

        let one_level = book(&[(99.5, 1.5)], &[(100.5, 1.5)]);
        let style = TopOfBookStyle::join().with_min_book_levels(2);
        assert_close(quote(style, &one_level), (99.9, 100.1));
    }
}
