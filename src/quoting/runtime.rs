//! Single-task dispatcher that owns every piece of quoting state.
//!
//! Collaborators push [`QuotingEvent`]s through a [`QuotingHandle`]; one tokio
//! task applies them in arrival order, together with the periodic refresh, so
//! a recomputation always runs to completion before the next one starts.

use super::{
    config::QuotingParameters,
    engine::QuotingEngine,
    safety::{SafetyCalculator, SafetyContext},
    types::{
        FairValue, Market, PositionReport, QuotingInputs, TargetBasePosition, Trade,
        TradeSafety, TwoSidedQuote,
    },
};
use crate::errors::{QuotingError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info};

const EVENT_CHANNEL_DEPTH: usize = 256;

/// Most trades kept for ping/pong pricing; the oldest are dropped first.
pub const MAX_TRADE_HISTORY: usize = 10_000;

/// Period of the safety/quote refresh timer.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub enum QuotingEvent {
    Market(Market),
    FairValue(FairValue),
    Parameters(QuotingParameters),
    Position(PositionReport),
    Ewma(f64),
    TargetPosition(TargetBasePosition),
    Fill(Trade),
    /// Replaces the known trade history, e.g. trades restored from storage.
    TradeHistory(Vec<Trade>),
}

pub struct QuotingRuntime {
    params: QuotingParameters,
    inputs: QuotingInputs,
    trades: Vec<Trade>,
    safety: SafetyCalculator,
    engine: QuotingEngine,
}

fn safety_context<'a>(
    params: &'a QuotingParameters,
    trades: &'a [Trade],
    inputs: &'a QuotingInputs,
) -> SafetyContext<'a> {
    SafetyContext {
        params,
        trades,
        fair_value: inputs.fair_value.as_ref(),
        position: inputs.position.as_ref(),
    }
}

impl QuotingRuntime {
    pub fn new(params: QuotingParameters) -> Self {
        Self::with_engine(params, QuotingEngine::new())
    }

    pub fn with_engine(params: QuotingParameters, engine: QuotingEngine) -> Self {
        Self {
            params,
            inputs: QuotingInputs::default(),
            trades: Vec::new(),
            safety: SafetyCalculator::new(),
            engine,
        }
    }

    pub fn params(&self) -> &QuotingParameters {
        &self.params
    }

    pub fn inputs(&self) -> &QuotingInputs {
        &self.inputs
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn latest_quote(&self) -> Option<&TwoSidedQuote> {
        self.engine.latest_quote()
    }

    pub fn latest_safety(&self) -> Option<&TradeSafety> {
        self.safety.latest()
    }

    /// For wiring quote-changed subscribers before the runtime is spawned.
    pub fn engine_mut(&mut self) -> &mut QuotingEngine {
        &mut self.engine
    }

    /// For wiring safety-changed and cancel-open-orders subscribers.
    pub fn safety_mut(&mut self) -> &mut SafetyCalculator {
        &mut self.safety
    }

    /// Applies one event and recomputes. Returns whether a new quote was published.
    ///
    /// Fair value and position updates only refresh the cache; the next market,
    /// fill, parameter, indicator or timer trigger picks them up.
    pub fn handle_event(&mut self, event: QuotingEvent, now: DateTime<Utc>) -> Result<bool> {
        match event {
            QuotingEvent::Market(market) => {
                let time = market.time;
                self.inputs.market = Some(market);
                self.recalc_quote(time)
            }
            QuotingEvent::FairValue(fv) => {
                self.inputs.fair_value = Some(fv);
                Ok(false)
            }
            QuotingEvent::Position(position) => {
                self.inputs.position = Some(position);
                Ok(false)
            }
            QuotingEvent::Parameters(params) => {
                debug!("Applying new quoting parameters: mode {:?}", params.mode);
                self.params = params;
                self.safety.on_new_parameters(
                    now,
                    safety_context(&self.params, &self.trades, &self.inputs),
                );
                self.recalc_quote(now)
            }
            QuotingEvent::Ewma(value) => {
                self.inputs.ewma = Some(value);
                if let Some(target) = self.inputs.target_position.as_mut() {
                    target.quote_ewma = Some(value);
                }
                self.recalc_quote(now)
            }
            QuotingEvent::TargetPosition(mut target) => {
                if target.quote_ewma.is_none() {
                    target.quote_ewma = self.inputs.ewma;
                }
                self.inputs.target_position = Some(target);
                self.recalc_quote(now)
            }
            QuotingEvent::Fill(trade) => {
                trade.validate()?;
                self.trades.push(trade.clone());
                self.prune_history();
                self.safety.on_trade(
                    &trade,
                    now,
                    safety_context(&self.params, &self.trades, &self.inputs),
                )?;
                self.recalc_quote(now)
            }
            QuotingEvent::TradeHistory(trades) => {
                for trade in &trades {
                    trade.validate()?;
                }
                info!("Loaded {} historical trades", trades.len());
                self.trades = trades;
                self.trades.sort_by_key(|trade| trade.time);
                self.prune_history();
                self.safety
                    .recompute(now, safety_context(&self.params, &self.trades, &self.inputs));
                self.recalc_quote(now)
            }
        }
    }

    /// Periodic refresh: ages the safety ledger, then requotes.
    pub fn on_timer(&mut self, now: DateTime<Utc>) -> Result<bool> {
        self.prune_history();
        self.safety
            .recompute(now, safety_context(&self.params, &self.trades, &self.inputs));
        self.recalc_quote(now)
    }

    /// Matching modes never price off fully matched trades, so those go. The
    /// history is otherwise capped at [`MAX_TRADE_HISTORY`].
    fn prune_history(&mut self) {
        if self.params.matches_pongs() {
            self.trades.retain(|trade| !trade.is_fully_matched());
        }
        if self.trades.len() > MAX_TRADE_HISTORY {
            let excess = self.trades.len() - MAX_TRADE_HISTORY;
            self.trades.drain(..excess);
            debug!("Dropped {excess} trades beyond the history cap");
        }
    }

    fn recalc_quote(&mut self, time: DateTime<Utc>) -> Result<bool> {
        self.engine
            .recalc_quote(time, &mut self.inputs, &self.params, self.safety.latest())
    }

    /// Moves the runtime onto its own task, refreshed every `refresh`.
    pub fn spawn(self, refresh: Duration) -> QuotingHandle {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = spawn_event_loop(self, event_rx, shutdown_rx, refresh);
        QuotingHandle {
            sender: QuotingSender { tx: event_tx },
            shutdown_tx,
            task,
        }
    }

    fn apply(&mut self, event: QuotingEvent) {
        if let Err(err) = self.handle_event(event, Utc::now()) {
            error!("Quoting event rejected: {err}");
        }
    }
}

fn spawn_event_loop(
    mut runtime: QuotingRuntime,
    mut rx: mpsc::Receiver<QuotingEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    refresh: Duration,
) -> JoinHandle<QuotingRuntime> {
    tokio::spawn(async move {
        let mut ticker = time::interval(refresh.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                event = rx.recv() => match event {
                    Some(event) => runtime.apply(event),
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(err) = runtime.on_timer(Utc::now()) {
                        error!("Quoting refresh failed: {err}");
                    }
                }
            }
        }
        // Drain what was already queued so no accepted event is lost.
        rx.close();
        while let Ok(event) = rx.try_recv() {
            runtime.apply(event);
        }
        info!("Quoting runtime stopped");
        runtime
    })
}

/// Cloneable event sender for collaborators.
#[derive(Clone, Debug)]
pub struct QuotingSender {
    tx: mpsc::Sender<QuotingEvent>,
}

impl QuotingSender {
    pub async fn send(&self, event: QuotingEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| QuotingError::RuntimeClosed)
    }
}

pub struct QuotingHandle {
    sender: QuotingSender,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<QuotingRuntime>,
}

impl QuotingHandle {
    pub fn sender(&self) -> QuotingSender {
        self.sender.clone()
    }

    pub async fn send(&self, event: QuotingEvent) -> Result<()> {
        self.sender.send(event).await
    }

    /// Stops the refresh timer and hands the runtime back once queued events
    /// have been applied.
    pub async fn shutdown(self) -> Result<QuotingRuntime> {
        // The task may already be gone; joining reports that.
        let _ = self.shutdown_tx.send(());
        self.task.await.map_err(|_| QuotingError::RuntimeClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quoting::{
        config::{Apr, QuotingMode},
        styles::test_support::{book, fair, position},
        types::{AprSide, Liquidity, Quote, Side},
    };
    use chrono::Duration as ChronoDuration;
    use std::sync::{Arc, Mutex};

    fn warm_up(runtime: &mut QuotingRuntime, now: DateTime<Utc>) {
        runtime
            .handle_event(QuotingEvent::FairValue(fair(100.0)), now)
            .unwrap();
        runtime
            .handle_event(QuotingEvent::Position(position(1.0, 100.0)), now)
            .unwrap();
        runtime
            .handle_event(
                QuotingEvent::TargetPosition(TargetBasePosition::new(1.0, now)),
                now,
            )
            .unwrap();
    }

    #[test]
    fn test_quote_requires_safety_snapshot() {
        let now = Utc::now();
        let mut runtime = QuotingRuntime::new(QuotingParameters::default());
        warm_up(&mut runtime, now);
        assert!(!runtime
            .handle_event(QuotingEvent::Market(book(&[], &[])), now)
            .unwrap());
        assert!(runtime.latest_quote().is_none());

        assert!(runtime.on_timer(now).unwrap());
        let quote = runtime.latest_quote().unwrap();
        assert_eq!(quote.bid, Some(Quote::new(99.9, 1.0)));
        assert_eq!(quote.ask, Some(Quote::new(100.1, 1.0)));
    }

    #[test]
    fn test_market_timestamp_stamps_quote() {
        let now = Utc::now();
        let mut runtime = QuotingRuntime::new(QuotingParameters::default());
        warm_up(&mut runtime, now);
        runtime.on_timer(now).unwrap();

        let mut market = book(&[], &[]);
        market.time = now - ChronoDuration::seconds(5);
        let market_time = market.time;
        assert!(runtime
            .handle_event(QuotingEvent::Market(market), now)
            .unwrap());
        assert_eq!(runtime.latest_quote().unwrap().time, market_time);

        let params = QuotingParameters {
            width_ping: 0.6,
            ..QuotingParameters::default()
        };
        assert!(runtime
            .handle_event(QuotingEvent::Parameters(params), now)
            .unwrap());
        let quote = runtime.latest_quote().unwrap();
        assert_eq!(quote.time, now);
        assert_eq!(quote.bid, Some(Quote::new(99.7, 1.0)));
        assert_eq!(quote.ask, Some(Quote::new(100.3, 1.0)));
    }

    #[test]
    fn test_fill_feeds_history_and_safety() {
        let now = Utc::now();
        let mut runtime = QuotingRuntime::new(QuotingParameters::default());
        warm_up(&mut runtime, now);
        runtime
            .handle_event(QuotingEvent::Market(book(&[], &[])), now)
            .unwrap();
        let fill = Trade::new("t1", now, 99.9, 1.0, Side::Bid, Liquidity::Make);
        runtime.handle_event(QuotingEvent::Fill(fill), now).unwrap();

        assert_eq!(runtime.trades().len(), 1);
        let safety = runtime.latest_safety().unwrap();
        assert!((safety.buy - 1.0).abs() < 1e-9);
        // One full buy size inside the window exceeds the 0.9 trades-per-minute limit.
        let quote = runtime.latest_quote().unwrap();
        assert!(quote.bid.is_none());
        assert!(quote.ask.is_some());
    }

    #[test]
    fn test_malformed_fill_is_rejected() {
        let now = Utc::now();
        let mut runtime = QuotingRuntime::new(QuotingParameters::default());
        let fill = Trade::new("bad", now, f64::NAN, 1.0, Side::Ask, Liquidity::Take);
        assert!(matches!(
            runtime.handle_event(QuotingEvent::Fill(fill), now),
            Err(QuotingError::MalformedTrade { .. })
        ));
        assert!(runtime.trades().is_empty());
    }

    #[test]
    fn test_ewma_forwarded_to_target_position() {
        let now = Utc::now();
        let mut runtime = QuotingRuntime::new(QuotingParameters::default());
        runtime.handle_event(QuotingEvent::Ewma(101.0), now).unwrap();
        runtime
            .handle_event(
                QuotingEvent::TargetPosition(TargetBasePosition::new(1.0, now)),
                now,
            )
            .unwrap();
        let target = runtime.inputs().target_position.as_ref().unwrap();
        assert_eq!(target.quote_ewma, Some(101.0));

        runtime.handle_event(QuotingEvent::Ewma(102.0), now).unwrap();
        let target = runtime.inputs().target_position.as_ref().unwrap();
        assert_eq!(target.quote_ewma, Some(102.0));
    }

    #[test]
    fn test_history_preload_sets_ping() {
        let now = Utc::now();
        let params = QuotingParameters {
            mode: QuotingMode::PingPong,
            ..QuotingParameters::default()
        };
        let mut runtime = QuotingRuntime::new(params);
        let mut old = Trade::new(
            "db1",
            now - ChronoDuration::hours(2),
            99.0,
            1.0,
            Side::Bid,
            Liquidity::Make,
        );
        old.loaded_from_db = true;
        runtime
            .handle_event(QuotingEvent::TradeHistory(vec![old]), now)
            .unwrap();
        let safety = runtime.latest_safety().unwrap();
        assert_eq!(safety.buy_ping, 99.0);
        assert_eq!(safety.buy, 0.0);
    }

    #[test]
    fn test_matching_modes_drop_consumed_history() {
        let now = Utc::now();
        let mut consumed = Trade::new("k1", now, 99.0, 1.0, Side::Bid, Liquidity::Make);
        consumed.matched_quantity = 1.0;
        let open = Trade::new("k2", now, 98.0, 1.0, Side::Bid, Liquidity::Make);
        let history = vec![consumed, open];

        let mut ping_pong = QuotingRuntime::new(QuotingParameters {
            mode: QuotingMode::PingPong,
            ..QuotingParameters::default()
        });
        ping_pong
            .handle_event(QuotingEvent::TradeHistory(history.clone()), now)
            .unwrap();
        assert_eq!(ping_pong.trades().len(), 2);

        let mut boomerang = QuotingRuntime::new(QuotingParameters {
            mode: QuotingMode::Boomerang,
            ..QuotingParameters::default()
        });
        boomerang
            .handle_event(QuotingEvent::TradeHistory(history), now)
            .unwrap();
        assert_eq!(boomerang.trades().len(), 1);
        assert_eq!(boomerang.trades()[0].trade_id, "k2");
    }

    #[test]
    fn test_history_is_capped_oldest_first() {
        let now = Utc::now();
        let history: Vec<Trade> = (0..MAX_TRADE_HISTORY + 5)
            .rev()
            .map(|i| {
                Trade::new(
                    format!("t{i}"),
                    now - ChronoDuration::seconds(i as i64),
                    100.0,
                    0.1,
                    Side::Ask,
                    Liquidity::Take,
                )
            })
            .collect();
        let mut runtime = QuotingRuntime::new(QuotingParameters::default());
        runtime
            .handle_event(QuotingEvent::TradeHistory(history), now)
            .unwrap();
        assert_eq!(runtime.trades().len(), MAX_TRADE_HISTORY);
        let oldest_kept = format!("t{}", MAX_TRADE_HISTORY - 1);
        assert_eq!(runtime.trades()[0].trade_id, oldest_kept);
        assert_eq!(runtime.trades()[MAX_TRADE_HISTORY - 1].trade_id, "t0");
    }

    #[tokio::test]
    async fn test_spawned_runtime_reports_target_feedback() {
        let params = QuotingParameters {
            aggressive_position_rebalancing: Apr::Size,
            ..QuotingParameters::default()
        };
        let mut runtime = QuotingRuntime::new(params);
        let feedback = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&feedback);
        runtime.engine_mut().on_target_position_feedback(move |target| {
            if let Ok(mut targets) = sink.lock() {
                targets.push(target.clone());
            }
        });

        let handle = runtime.spawn(Duration::from_millis(20));
        let now = Utc::now();
        handle
            .send(QuotingEvent::FairValue(fair(100.0)))
            .await
            .unwrap();
        handle
            .send(QuotingEvent::Position(position(0.05, 100.0)))
            .await
            .unwrap();
        handle.send(QuotingEvent::Ewma(100.3)).await.unwrap();
        handle
            .send(QuotingEvent::TargetPosition(TargetBasePosition::new(1.0, now)))
            .await
            .unwrap();
        handle
            .send(QuotingEvent::Market(book(&[], &[])))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        {
            let targets = feedback.lock().unwrap();
            let last = targets.last().unwrap();
            assert_eq!(last.aggressive_sides, vec![AprSide::Bid]);
            assert_eq!(last.quote_ewma, Some(100.3));
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawned_runtime_processes_in_order() {
        let mut runtime = QuotingRuntime::new(QuotingParameters::default());
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&published);
        runtime.engine_mut().subscribe(move |quote| {
            if let Ok(mut quotes) = sink.lock() {
                quotes.push(quote.clone());
            }
        });

        let handle = runtime.spawn(Duration::from_millis(20));
        let now = Utc::now();
        handle
            .send(QuotingEvent::FairValue(fair(100.0)))
            .await
            .unwrap();
        handle
            .send(QuotingEvent::Position(position(1.0, 100.0)))
            .await
            .unwrap();
        handle
            .send(QuotingEvent::TargetPosition(TargetBasePosition::new(1.0, now)))
            .await
            .unwrap();
        handle
            .send(QuotingEvent::Market(book(&[], &[])))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sender = handle.sender();
        let runtime = handle.shutdown().await.unwrap();
        let quote = runtime.latest_quote().unwrap();
        assert_eq!(quote.bid, Some(Quote::new(99.9, 1.0)));
        assert_eq!(published.lock().unwrap().len(), 1);

        assert!(matches!(
            sender.send(QuotingEvent::Ewma(1.0)).await,
            Err(QuotingError::RuntimeClosed)
        ));
    }
}
