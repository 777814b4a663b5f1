use crate::errors::{QuotingError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Single aggregated price level of the filtered book.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarketLevel {
    pub price: f64,
    pub size: f64,
}

impl MarketLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Filtered order book: bids best (highest) first, asks best (lowest) first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub bids: Vec<MarketLevel>,
    pub asks: Vec<MarketLevel>,
    pub time: DateTime<Utc>,
}

impl Market {
    pub fn new(bids: Vec<MarketLevel>, asks: Vec<MarketLevel>, time: DateTime<Utc>) -> Self {
        Self { bids, asks, time }
    }

    pub fn empty(time: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), Vec::new(), time)
    }

    pub fn best_bid(&self) -> Option<&MarketLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&MarketLevel> {
        self.asks.first()
    }

    /// Top-of-book width, `None` while either side is empty.
    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FairValue {
    pub price: f64,
    pub time: DateTime<Utc>,
}

impl FairValue {
    pub fn new(price: f64, time: DateTime<Utc>) -> Self {
        Self { price, time }
    }
}

const QUOTE_EQUALITY_TOLERANCE: f64 = 1e-3;

/// One side of a published quote.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    pub size: f64,
}

impl Quote {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }

    pub fn approx_eq(&self, other: &Quote) -> bool {
        (self.price - other.price).abs() < QUOTE_EQUALITY_TOLERANCE
            && (self.size - other.size).abs() < QUOTE_EQUALITY_TOLERANCE
    }
}

/// Bid/ask pair handed to order management. `None` means "do not quote that side".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TwoSidedQuote {
    pub bid: Option<Quote>,
    pub ask: Option<Quote>,
    pub time: DateTime<Utc>,
}

impl TwoSidedQuote {
    pub fn new(bid: Option<Quote>, ask: Option<Quote>, time: DateTime<Utc>) -> Self {
        Self { bid, ask, time }
    }

    /// Structural equality of both sides, ignoring the timestamp.
    pub fn same_sides(&self, other: &TwoSidedQuote) -> bool {
        self.bid == other.bid && self.ask == other.ask
    }
}

/// Unrounded candidate produced by a quoting style. Every field is independently optional.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RawQuote {
    pub bid_px: Option<f64>,
    pub bid_sz: Option<f64>,
    pub ask_px: Option<f64>,
    pub ask_sz: Option<f64>,
}

impl RawQuote {
    pub fn new(bid_px: f64, bid_sz: f64, ask_px: f64, ask_sz: f64) -> Self {
        Self {
            bid_px: Some(bid_px),
            bid_sz: Some(bid_sz),
            ask_px: Some(ask_px),
            ask_sz: Some(ask_sz),
        }
    }

    pub fn clear_bid(&mut self) {
        self.bid_px = None;
        self.bid_sz = None;
    }

    pub fn clear_ask(&mut self) {
        self.ask_px = None;
        self.ask_sz = None;
    }

    pub fn bid(&self) -> Option<Quote> {
        Some(Quote::new(self.bid_px?, self.bid_sz?))
    }

    pub fn ask(&self) -> Option<Quote> {
        Some(Quote::new(self.ask_px?, self.ask_sz?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn from_code(raw: &str) -> Result<Self> {
        match raw {
            "B" | "BUY" | "Bid" => Ok(Side::Bid),
            "S" | "SELL" | "Ask" => Ok(Side::Ask),
            other => Err(QuotingError::UnknownSide(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liquidity {
    Make,
    Take,
}

impl Liquidity {
    /// Maps an execution report liquidity flag. Unknown codes are rejected rather than guessed.
    pub fn from_code(raw: &str) -> Result<Self> {
        match raw {
            "A" | "M" => Ok(Liquidity::Make),
            "R" | "T" => Ok(Liquidity::Take),
            other => Err(QuotingError::UnknownLiquidity(other.to_string())),
        }
    }
}

/// Opposing trade matched against this one by the pong bookkeeping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeMatch {
    pub time: DateTime<Utc>,
    pub price: f64,
    pub value: f64,
    pub diff: f64,
}

/// Executed fill.
///
/// `net_remaining` is only reduced by the safety netting pass on the safety
/// ledger's own copy; `matched_quantity` is maintained by the order broker when
/// a later opposing trade closes this one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub time: DateTime<Utc>,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub value: f64,
    pub liquidity: Liquidity,
    #[serde(default)]
    pub fee_charged: f64,
    #[serde(default)]
    pub loaded_from_db: bool,
    /// Reset to `quantity` when the fill enters the safety ledger.
    #[serde(default)]
    pub net_remaining: f64,
    #[serde(default)]
    pub matched_quantity: f64,
    #[serde(default)]
    pub matched: Option<TradeMatch>,
}

impl Trade {
    pub fn new(
        trade_id: impl Into<String>,
        time: DateTime<Utc>,
        price: f64,
        quantity: f64,
        side: Side,
        liquidity: Liquidity,
    ) -> Self {
        Self {
            trade_id: trade_id.into(),
            time,
            price,
            quantity,
            side,
            value: price * quantity,
            liquidity,
            fee_charged: 0.0,
            loaded_from_db: false,
            net_remaining: quantity,
            matched_quantity: 0.0,
            matched: None,
        }
    }

    pub fn is_fully_matched(&self) -> bool {
        self.matched_quantity >= self.quantity
    }

    pub fn validate(&self) -> Result<()> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(QuotingError::malformed_trade(
                &self.trade_id,
                format!("price {} is not a positive number", self.price),
            ));
        }
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(QuotingError::malformed_trade(
                &self.trade_id,
                format!("quantity {} is not a positive number", self.quantity),
            ));
        }
        Ok(())
    }
}

/// Trade-rate throttling signals derived from the rolling ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeSafety {
    pub buy: f64,
    pub sell: f64,
    pub combined: f64,
    pub buy_ping: f64,
    pub sell_pong: f64,
    pub time: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub base_amount: f64,
    pub quote_amount: f64,
    pub base_held_amount: f64,
    pub quote_held_amount: f64,
    /// Total equity expressed in the base currency.
    pub value: f64,
    pub quote_value: f64,
    pub time: DateTime<Utc>,
}

impl PositionReport {
    pub fn total_base(&self) -> f64 {
        self.base_amount + self.base_held_amount
    }

    pub fn total_quote(&self) -> f64 {
        self.quote_amount + self.quote_held_amount
    }
}

/// Side forced by aggressive position rebalancing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AprSide {
    Bid,
    Sell,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetBasePosition {
    pub base: f64,
    #[serde(default)]
    pub aggressive_sides: Vec<AprSide>,
    #[serde(default)]
    pub quote_ewma: Option<f64>,
    pub time: DateTime<Utc>,
}

impl TargetBasePosition {
    pub fn new(base: f64, time: DateTime<Utc>) -> Self {
        Self {
            base,
            aggressive_sides: Vec::new(),
            quote_ewma: None,
            time,
        }
    }
}

/// Latest-value cache of every collaborator snapshot the engine reads.
#[derive(Clone, Debug, Default)]
pub struct QuotingInputs {
    pub market: Option<Market>,
    pub fair_value: Option<FairValue>,
    pub position: Option<PositionReport>,
    pub ewma: Option<f64>,
    pub target_position: Option<TargetBasePosition>,
}
