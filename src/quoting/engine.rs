use super::{
    config::{round_to_tick, Apr, PingAt, QuotingParameters, QUOTE_TICK},
    events::EventHub,
    styles::QuotingStyleRegistry,
    types::{
        AprSide, FairValue, Market, PositionReport, Quote, QuotingInputs, RawQuote,
        TargetBasePosition, TradeSafety, TwoSidedQuote,
    },
};
use crate::{errors::Result, timings::time_block};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Smallest size a published side may carry.
pub const MIN_QUOTE_SIZE: f64 = 1e-2;
const SIZE_CHANGE_TOLERANCE: f64 = 5e-3;
const PRICE_CHANGE_TOLERANCE: f64 = 0.009999;

/// Single producer of the published two-sided quote.
#[derive(Debug, Default)]
pub struct QuotingEngine {
    registry: QuotingStyleRegistry,
    latest: Option<TwoSidedQuote>,
    quote_changed: EventHub<Option<TwoSidedQuote>>,
    last_feedback: Option<TargetBasePosition>,
    target_feedback: EventHub<TargetBasePosition>,
}

impl QuotingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: QuotingStyleRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn latest_quote(&self) -> Option<&TwoSidedQuote> {
        self.latest.as_ref()
    }

    /// Handlers receive every accepted change, including a switch to "no quote".
    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&Option<TwoSidedQuote>) + Send + 'static,
    {
        self.quote_changed.subscribe(handler);
    }

    /// Handlers receive the target position whenever its aggressive sides or
    /// forwarded EWMA change, so the owner of the target can pick them up.
    pub fn on_target_position_feedback<F>(&mut self, handler: F)
    where
        F: FnMut(&TargetBasePosition) + Send + 'static,
    {
        self.target_feedback.subscribe(handler);
    }

    /// Recomputes against the current inputs and publishes if the result differs
    /// from the last published quote. Returns whether a change was published.
    pub fn recalc_quote(
        &mut self,
        time: DateTime<Utc>,
        inputs: &mut QuotingInputs,
        params: &QuotingParameters,
        safety: Option<&TradeSafety>,
    ) -> Result<bool> {
        let next = time_block("quote_recompute", || {
            self.compute_quote(time, &mut *inputs, params, safety)
        });
        self.publish_target_feedback(inputs);
        let next = next?;
        let changed = match (&self.latest, &next) {
            (None, None) => false,
            (Some(prev), Some(next)) => !prev.same_sides(next),
            _ => true,
        };
        if !changed {
            return Ok(false);
        }
        match &next {
            Some(quote) => debug!(bid = ?quote.bid, ask = ?quote.ask, "Publishing quote"),
            None => debug!("Publishing no quote"),
        }
        self.latest = next;
        self.quote_changed.trigger(&self.latest);
        Ok(true)
    }

    fn publish_target_feedback(&mut self, inputs: &QuotingInputs) {
        let Some(target) = inputs.target_position.as_ref() else {
            return;
        };
        let unchanged = self.last_feedback.as_ref().map_or(false, |prev| {
            prev.aggressive_sides == target.aggressive_sides && prev.quote_ewma == target.quote_ewma
        });
        if unchanged {
            return;
        }
        debug!(
            sides = ?target.aggressive_sides,
            ewma = ?target.quote_ewma,
            "Target position feedback"
        );
        self.last_feedback = Some(target.clone());
        self.target_feedback.trigger(target);
    }

    /// Runs the full pipeline without publishing. Sides that moved less than the
    /// change tolerances are carried over from the last published quote.
    pub fn compute_quote(
        &self,
        time: DateTime<Utc>,
        inputs: &mut QuotingInputs,
        params: &QuotingParameters,
        safety: Option<&TradeSafety>,
    ) -> Result<Option<TwoSidedQuote>> {
        let Some(raw) = self.compute_raw(inputs, params, safety)? else {
            return Ok(None);
        };
        let prev = self.latest.as_ref();
        Ok(Some(TwoSidedQuote::new(
            debounce_side(raw.bid(), prev.and_then(|q| q.bid.as_ref())),
            debounce_side(raw.ask(), prev.and_then(|q| q.ask.as_ref())),
            time,
        )))
    }

    fn compute_raw(
        &self,
        inputs: &mut QuotingInputs,
        params: &QuotingParameters,
        safety: Option<&TradeSafety>,
    ) -> Result<Option<RawQuote>> {
        let (Some(fv), Some(market), Some(position)) = (
            inputs.fair_value.as_ref(),
            inputs.market.as_ref(),
            inputs.position.as_ref(),
        ) else {
            debug!("Missing fair value, market or position; no quote");
            return Ok(None);
        };

        let style = self.registry.get(params.mode)?;
        let Some(mut raw) = style.generate_quote(market, fv, params, position) else {
            debug!("{:?} style produced no quote", params.mode);
            return Ok(None);
        };

        if params.ewma_protection {
            if let Some(ewma) = inputs.ewma {
                apply_ewma_protection(&mut raw, ewma);
            }
        }

        let Some(target) = inputs.target_position.as_mut() else {
            debug!("No target base position yet; no quote");
            return Ok(None);
        };

        let buy_size = params.buy_size_for(Some(position));
        let sell_size = params.sell_size_for(Some(position));
        let (trades_multiplier, size_multiplier) = params.super_trade_multipliers(market);
        if size_multiplier > 1.0 {
            if let Some(size) = raw.bid_sz.as_mut() {
                *size = (size_multiplier * buy_size).min(position.quote_amount / fv.price / 2.0);
            }
            if let Some(size) = raw.ask_sz.as_mut() {
                *size = (size_multiplier * sell_size).min(position.base_amount / 2.0);
            }
        }

        let aggressive_sides = rebalance_position(&mut raw, params, position, fv, target.base);
        target.aggressive_sides = aggressive_sides.clone();

        let Some(safety) = safety else {
            warn!("No trade safety snapshot yet; withholding quote");
            return Ok(None);
        };

        if params.is_ping_pong_mode() {
            apply_ping_pong_floors(&mut raw, params, safety, &aggressive_sides);
        }
        avoid_book_crossing(&mut raw, market, fv);
        throttle_on_trade_rate(
            &mut raw,
            params,
            safety,
            position,
            fv,
            trades_multiplier,
            (buy_size, sell_size),
        );
        round_and_clamp(&mut raw);

        Ok(Some(raw))
    }
}

fn apply_ewma_protection(raw: &mut RawQuote, ewma: f64) {
    if let Some(ask) = raw.ask_px.as_mut() {
        *ask = ask.max(ewma);
    }
    if let Some(bid) = raw.bid_px.as_mut() {
        *bid = bid.min(ewma);
    }
}

/// Pulls the position back toward `target_base`. Returns the sides that were
/// forced by aggressive rebalancing.
fn rebalance_position(
    raw: &mut RawQuote,
    params: &QuotingParameters,
    position: &PositionReport,
    fv: &FairValue,
    target_base: f64,
) -> Vec<AprSide> {
    let divergence = params.position_divergence_for(position);
    let total_base = position.total_base();
    let aggressive = params.aggressive_position_rebalancing != Apr::Off;
    let mut sides = Vec::new();

    if total_base < target_base - divergence {
        raw.clear_ask();
        if aggressive {
            sides.push(AprSide::Bid);
            raw.bid_sz = Some(
                (params.apr_multiplier * params.buy_size_for(Some(position)))
                    .min(target_base - total_base)
                    .min(position.quote_amount / fv.price / 2.0),
            );
        }
    }
    if total_base > target_base + divergence {
        raw.clear_bid();
        if aggressive {
            sides.push(AprSide::Sell);
            raw.ask_sz = Some(
                (params.apr_multiplier * params.sell_size_for(Some(position)))
                    .min(total_base - target_base)
                    .min(position.base_amount / 2.0),
            );
        }
    }
    sides
}

fn apply_ping_pong_floors(
    raw: &mut RawQuote,
    params: &QuotingParameters,
    safety: &TradeSafety,
    aggressive_sides: &[AprSide],
) {
    let width_forced = |side: AprSide| {
        params.aggressive_position_rebalancing == Apr::SizeWidth && aggressive_sides.contains(&side)
    };
    let aggressive_pong = params.pong_at.is_aggressive();

    let has_size = |size: Option<f64>| size.map_or(false, |s| s != 0.0);

    if has_size(raw.ask_sz) && safety.buy_ping != 0.0 {
        let floor = safety.buy_ping + params.width_pong;
        if width_forced(AprSide::Sell) || aggressive_pong || raw.ask_px.map_or(true, |px| px < floor)
        {
            raw.ask_px = Some(floor);
        }
    }
    if has_size(raw.bid_sz) && safety.sell_pong != 0.0 {
        let ceiling = safety.sell_pong - params.width_pong;
        if width_forced(AprSide::Bid) || aggressive_pong || raw.bid_px.map_or(true, |px| px > ceiling)
        {
            raw.bid_px = Some(ceiling);
        }
    }
}

/// Tucks each side one tick behind the first book level beyond it, as long as
/// that stays on its own side of fair value.
fn avoid_book_crossing(raw: &mut RawQuote, market: &Market, fv: &FairValue) {
    if let Some(ask) = raw.ask_px {
        for level in market.asks.iter().filter(|level| level.price > ask) {
            let tucked = level.price - QUOTE_TICK;
            if tucked > fv.price {
                raw.ask_px = Some(tucked);
                break;
            }
        }
    }
    if let Some(bid) = raw.bid_px {
        for level in market.bids.iter().filter(|level| level.price < bid) {
            let tucked = level.price + QUOTE_TICK;
            if tucked < fv.price {
                raw.bid_px = Some(tucked);
                break;
            }
        }
    }
}

fn throttle_on_trade_rate(
    raw: &mut RawQuote,
    params: &QuotingParameters,
    safety: &TradeSafety,
    position: &PositionReport,
    fv: &FairValue,
    trades_multiplier: f64,
    (buy_size, sell_size): (f64, f64),
) {
    let rate_limit = params.trades_per_minute * trades_multiplier;
    let ping_pong = params.is_ping_pong_mode();

    let hold_ask = ping_pong
        && safety.buy_ping == 0.0
        && (matches!(
            params.ping_at,
            PingAt::StopPings | PingAt::BidSide | PingAt::DepletedAskSide
        ) || (position.total_quote() / fv.price > buy_size
            && matches!(params.ping_at, PingAt::DepletedSide | PingAt::DepletedBidSide)));
    if safety.sell > rate_limit || hold_ask {
        raw.clear_ask();
    }

    let hold_bid = ping_pong
        && safety.sell_pong == 0.0
        && (matches!(
            params.ping_at,
            PingAt::StopPings | PingAt::AskSide | PingAt::DepletedBidSide
        ) || (position.total_base() > sell_size
            && matches!(params.ping_at, PingAt::DepletedSide | PingAt::DepletedAskSide)));
    if safety.buy > rate_limit || hold_bid {
        raw.clear_bid();
    }
}

fn round_and_clamp(raw: &mut RawQuote) {
    if let Some(bid) = raw.bid_px.as_mut() {
        *bid = round_to_tick(*bid).max(0.0);
    }
    if let Some(ask) = raw.ask_px.as_mut() {
        let floor = round_to_tick(raw.bid_px.unwrap_or(0.0) + QUOTE_TICK);
        *ask = round_to_tick(*ask).max(floor);
    }
    for size in [raw.bid_sz.as_mut(), raw.ask_sz.as_mut()].into_iter().flatten() {
        *size = round_to_tick(*size).max(MIN_QUOTE_SIZE);
    }
}

/// Keeps the previous side unless the size or the price moved enough to matter.
fn debounce_side(next: Option<Quote>, prev: Option<&Quote>) -> Option<Quote> {
    let next = next?;
    let Some(prev) = prev else {
        return Some(next);
    };
    if (next.size - prev.size).abs() > SIZE_CHANGE_TOLERANCE {
        return Some(next);
    }
    if (next.price - prev.price).abs() < PRICE_CHANGE_TOLERANCE {
        return Some(*prev);
    }
    Some(next)
}
