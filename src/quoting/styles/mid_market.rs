use crate::quoting::{
    config::QuotingParameters,
    types::{FairValue, PositionReport, RawQuote},
};

/// Quotes symmetrically around fair value, half the ping width on each side.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MidMarketStyle;

impl MidMarketStyle {
    pub fn generate_quote(
        &self,
        fv: &FairValue,
        params: &QuotingParameters,
        position: &PositionReport,
    ) -> Option<RawQuote> {
        if !fv.price.is_finite() || fv.price <= 0.0 {
            return None;
        }
        let half_width = params.width_ping / 2.0;
        Some(RawQuote::new(
            (fv.price - half_width).max(0.0),
            params.buy_size_for(Some(position)),
            fv.price + half_width,
            params.sell_size_for(Some(position)),
        ))
    }
}
