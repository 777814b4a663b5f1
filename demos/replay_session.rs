//! Replays a synthetic session through the quoting runtime and prints every
//! published quote.
//!
//! Optional environment variables:
//! - `QUOTING_CONFIG` path to a TOML file with a `[quoting]` table
//! - any `QUOTING_*` parameter override

use chrono::Utc;
use pingpong_quoter::quoting::{
    runtime::DEFAULT_REFRESH_INTERVAL,
    types::{FairValue, Liquidity, Market, MarketLevel, PositionReport, Side, TargetBasePosition},
};
use pingpong_quoter::{QuotingEvent, QuotingParameters, QuotingRuntime, Trade};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::time::Duration;

fn synthetic_book(mid: f64, half_spread: f64) -> Market {
    let bids = (0..3)
        .map(|i| MarketLevel::new(mid - half_spread - i as f64 * 0.05, 1.5 + i as f64))
        .collect();
    let asks = (0..3)
        .map(|i| MarketLevel::new(mid + half_spread + i as f64 * 0.05, 1.5 + i as f64))
        .collect();
    Market::new(bids, asks, Utc::now())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let params = match std::env::var("QUOTING_CONFIG") {
        Ok(path) => QuotingParameters::from_file(path)?,
        Err(_) => QuotingParameters::default(),
    };
    println!("Quoting in {:?} mode", params.mode);

    let mut runtime = QuotingRuntime::new(params);
    runtime.engine_mut().subscribe(|quote| match quote {
        Some(quote) => println!(
            "quote  bid {:>10} ask {:>10}",
            quote
                .bid
                .map(|q| format!("{:.2}x{:.2}", q.price, q.size))
                .unwrap_or_else(|| "-".into()),
            quote
                .ask
                .map(|q| format!("{:.2}x{:.2}", q.price, q.size))
                .unwrap_or_else(|| "-".into()),
        ),
        None => println!("quote  none"),
    });
    runtime.safety_mut().subscribe(|safety| {
        println!(
            "safety buy {:.3} sell {:.3} combined {:.3} ping {:.2} pong {:.2}",
            safety.buy, safety.sell, safety.combined, safety.buy_ping, safety.sell_pong
        );
    });
    runtime.safety_mut().on_cancel_open_orders(|_| println!("cancel all open orders"));
    runtime.engine_mut().on_target_position_feedback(|target| {
        println!(
            "target base {:.3} aggressive {:?} ewma {:?}",
            target.base, target.aggressive_sides, target.quote_ewma
        );
    });

    let handle = runtime.spawn(DEFAULT_REFRESH_INTERVAL);
    let now = Utc::now();
    handle
        .send(QuotingEvent::Position(PositionReport {
            base_amount: 2.0,
            quote_amount: 200.0,
            base_held_amount: 0.0,
            quote_held_amount: 0.0,
            value: 4.0,
            quote_value: 400.0,
            time: now,
        }))
        .await?;
    handle
        .send(QuotingEvent::TargetPosition(TargetBasePosition::new(2.0, now)))
        .await?;

    let mut rng = StdRng::seed_from_u64(42);
    let mut mid = 100.0;
    for step in 0..20 {
        mid += rng.gen_range(-0.15..0.15);
        let now = Utc::now();
        handle
            .send(QuotingEvent::FairValue(FairValue::new(mid, now)))
            .await?;
        handle
            .send(QuotingEvent::Market(synthetic_book(mid, rng.gen_range(0.02..0.3))))
            .await?;
        if step % 5 == 4 {
            let side = if rng.gen_bool(0.5) { Side::Bid } else { Side::Ask };
            let price = match side {
                Side::Bid => mid - 0.1,
                Side::Ask => mid + 0.1,
            };
            let fill = Trade::new(format!("fill-{step}"), now, price, 0.5, side, Liquidity::Make);
            handle.send(QuotingEvent::Fill(fill)).await?;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    let runtime = handle.shutdown().await?;
    println!(
        "Replayed {} fills; final quote {:?}",
        runtime.trades().len(),
        runtime.latest_quote()
    );
    Ok(())
}
