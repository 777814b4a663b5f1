use super::{
    config::{QuotingMode, QuotingParameters},
    events::EventHub,
    types::{FairValue, PositionReport, Side, Trade, TradeSafety},
};
use crate::{errors::Result, timings::time_block};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Remaining quantity below which a netted ledger entry is dropped.
pub const NETTING_EPSILON: f64 = 1e-4;
const COMBINED_TOLERANCE: f64 = 1e-3;
const PING_TOLERANCE: f64 = 1e-2;

/// Everything a safety recompute reads besides its own ledger.
#[derive(Clone, Copy, Debug)]
pub struct SafetyContext<'a> {
    pub params: &'a QuotingParameters,
    /// Every trade the broker knows about, not only the open ledger.
    pub trades: &'a [Trade],
    pub fair_value: Option<&'a FairValue>,
    pub position: Option<&'a PositionReport>,
}

/// Rolling trade ledger and the trade-rate safety signals derived from it.
#[derive(Debug, Default)]
pub struct SafetyCalculator {
    buys: Vec<Trade>,
    sells: Vec<Trade>,
    latest: Option<TradeSafety>,
    safety_changed: EventHub<TradeSafety>,
    cancel_open_orders: EventHub<()>,
}

impl SafetyCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<&TradeSafety> {
        self.latest.as_ref()
    }

    pub fn subscribe<F>(&mut self, handler: F)
    where
        F: FnMut(&TradeSafety) + Send + 'static,
    {
        self.safety_changed.subscribe(handler);
    }

    pub fn on_cancel_open_orders<F>(&mut self, handler: F)
    where
        F: FnMut(&()) + Send + 'static,
    {
        self.cancel_open_orders.subscribe(handler);
    }

    pub fn open_buys(&self) -> &[Trade] {
        &self.buys
    }

    pub fn open_sells(&self) -> &[Trade] {
        &self.sells
    }

    /// Records a fill in the open ledger and recomputes. Returns whether a new
    /// snapshot was published.
    pub fn on_trade(
        &mut self,
        trade: &Trade,
        now: DateTime<Utc>,
        ctx: SafetyContext<'_>,
    ) -> Result<bool> {
        trade.validate()?;
        if is_older_than(trade, now, ctx.params) {
            debug!(
                "Ignoring fill {} older than the {}s trade-rate window",
                trade.trade_id, ctx.params.trade_rate_seconds
            );
            return Ok(false);
        }
        let mut entry = trade.clone();
        entry.net_remaining = entry.quantity;
        match entry.side {
            Side::Bid => self.buys.push(entry),
            Side::Ask => self.sells.push(entry),
        }
        Ok(self.recompute(now, ctx))
    }

    pub fn on_new_parameters(&mut self, now: DateTime<Utc>, ctx: SafetyContext<'_>) -> bool {
        if ctx.params.mode == QuotingMode::Ak47 {
            info!("Quoting parameters changed in AK47 mode; cancelling open orders");
            self.cancel_open_orders.trigger(&());
        }
        self.recompute(now, ctx)
    }

    /// Full recompute: reference prices, ledger pruning, netting and ratios.
    pub fn recompute(&mut self, now: DateTime<Utc>, ctx: SafetyContext<'_>) -> bool {
        let next = time_block("safety_recompute", || self.compute(now, ctx));
        self.publish(next)
    }

    fn compute(&mut self, now: DateTime<Utc>, ctx: SafetyContext<'_>) -> TradeSafety {
        let params = ctx.params;
        let buy_size = params.buy_size_for(ctx.position);
        let sell_size = params.sell_size_for(ctx.position);
        let fv = ctx.fair_value.map(|fv| fv.price).filter(|price| *price > 0.0);

        // A buy ping is exited by selling, so it is sized against the sell size.
        let buy_ping = reference_price(ctx.trades, Side::Bid, sell_size, params, fv);
        let sell_pong = reference_price(ctx.trades, Side::Ask, buy_size, params, fv);

        self.buys.retain(|t| !is_older_than(t, now, params));
        self.sells.retain(|t| !is_older_than(t, now, params));
        // The back of each ledger holds the cheapest buy and the richest sell.
        self.buys.sort_by(|a, b| b.price.total_cmp(&a.price));
        self.sells.sort_by(|a, b| a.price.total_cmp(&b.price));
        net_offsetting_trades(&mut self.buys, &mut self.sells);

        let buy_volume: f64 = self.buys.iter().map(|t| t.net_remaining).sum();
        let sell_volume: f64 = self.sells.iter().map(|t| t.net_remaining).sum();

        TradeSafety {
            buy: ratio(buy_volume, buy_size),
            sell: ratio(sell_volume, sell_size),
            combined: ratio(buy_volume + sell_volume, buy_size + sell_size / 2.0),
            buy_ping,
            sell_pong,
            time: now,
        }
    }

    fn publish(&mut self, next: TradeSafety) -> bool {
        let changed = match &self.latest {
            None => true,
            Some(prev) => {
                (next.combined - prev.combined).abs() > COMBINED_TOLERANCE
                    || (next.buy_ping - prev.buy_ping).abs() >= PING_TOLERANCE
                    || (next.sell_pong - prev.sell_pong).abs() >= PING_TOLERANCE
            }
        };
        if !changed {
            return false;
        }
        debug!(
            buy = next.buy,
            sell = next.sell,
            combined = next.combined,
            buy_ping = next.buy_ping,
            sell_pong = next.sell_pong,
            "Trade safety updated"
        );
        self.safety_changed.trigger(&next);
        self.latest = Some(next);
        true
    }
}

fn is_older_than(trade: &Trade, now: DateTime<Utc>, params: &QuotingParameters) -> bool {
    let age_ms = (now - trade.time).num_milliseconds().unsigned_abs();
    age_ms > params.trade_rate_seconds.saturating_mul(1000)
}

fn ratio(volume: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        volume / limit
    } else {
        0.0
    }
}

/// Offsets the richest remaining sell against the cheapest remaining buy
/// while the sell price covers the buy price.
fn net_offsetting_trades(buys: &mut Vec<Trade>, sells: &mut Vec<Trade>) {
    while let (Some(buy), Some(sell)) = (buys.last_mut(), sells.last_mut()) {
        if sell.price < buy.price {
            break;
        }
        let sell_qty = sell.net_remaining;
        let buy_qty = buy.net_remaining;
        buy.net_remaining -= sell_qty;
        sell.net_remaining -= buy_qty;
        let buy_done = buy.net_remaining < NETTING_EPSILON;
        let sell_done = sell.net_remaining < NETTING_EPSILON;
        if buy_done {
            buys.pop();
        }
        if sell_done {
            sells.pop();
        }
    }
}

struct PingAccumulator {
    target: f64,
    quantity: f64,
    notional: f64,
}

impl PingAccumulator {
    fn new(target: f64) -> Self {
        Self {
            target,
            quantity: 0.0,
            notional: 0.0,
        }
    }

    fn is_full(&self) -> bool {
        self.quantity >= self.target
    }

    fn take(&mut self, trade: &Trade) {
        let qty = (self.target - self.quantity).min(trade.quantity);
        self.notional += trade.price * qty;
        self.quantity += qty;
    }

    fn average(&self) -> f64 {
        if self.quantity > 0.0 {
            self.notional / self.quantity
        } else {
            0.0
        }
    }
}

/// Quantity-weighted price of our own `side` trades, accumulated up to `target`.
///
/// Short-ping policies first take trades within `width_pong` of fair value,
/// farthest from fair value first, then top up from any trade on the good side
/// of fair value. Long-ping policies only run the second pass. The second pass
/// takes the most aggressive prices first.
fn reference_price(
    trades: &[Trade],
    side: Side,
    target: f64,
    params: &QuotingParameters,
    fv: Option<f64>,
) -> f64 {
    if target <= 0.0 {
        return 0.0;
    }
    let mut candidates: Vec<&Trade> = trades
        .iter()
        .filter(|t| t.side == side)
        .filter(|t| !params.matches_pongs() || !t.is_fully_matched())
        .collect();
    let mut acc = PingAccumulator::new(target);
    let mut taken = vec![false; candidates.len()];

    let beats_fair = |price: f64, fv: f64| match side {
        Side::Bid => price < fv,
        Side::Ask => price > fv,
    };

    if let (true, Some(fv)) = (params.pong_at.is_short_ping(), fv) {
        let within_pong = |price: f64| match side {
            Side::Bid => price < fv && price > fv - params.width_pong,
            Side::Ask => price > fv && price < fv + params.width_pong,
        };
        let mut order: Vec<usize> = (0..candidates.len()).collect();
        order.sort_by(|&a, &b| match side {
            Side::Bid => candidates[a].price.total_cmp(&candidates[b].price),
            Side::Ask => candidates[b].price.total_cmp(&candidates[a].price),
        });
        for idx in order {
            if acc.is_full() {
                break;
            }
            if within_pong(candidates[idx].price) {
                acc.take(candidates[idx]);
                taken[idx] = true;
            }
        }
    }

    if !acc.is_full() {
        let mut pending: Vec<(usize, &Trade)> = candidates
            .drain(..)
            .enumerate()
            .filter(|(idx, _)| !taken[*idx])
            .collect();
        pending.sort_by(|(_, a), (_, b)| match side {
            Side::Bid => b.price.total_cmp(&a.price),
            Side::Ask => a.price.total_cmp(&b.price),
        });
        for (_, trade) in pending {
            if acc.is_full() {
                break;
            }
            if fv.map_or(true, |fv| beats_fair(trade.price, fv)) {
                acc.take(trade);
            }
        }
    }

    acc.average()
}
