use super::types::{Market, PositionReport};
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{env, fs, path::Path};

/// Price/size increment every published quote is rounded to.
pub const QUOTE_TICK: f64 = 1e-2;
const TICKS_PER_UNIT: f64 = 100.0;

pub fn round_to_tick(value: f64) -> f64 {
    (value * TICKS_PER_UNIT).round() / TICKS_PER_UNIT
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotingMode {
    Top,
    Mid,
    Join,
    InverseJoin,
    InverseTop,
    PingPong,
    Boomerang,
    #[serde(rename = "AK47", alias = "Ak47")]
    Ak47,
}

impl QuotingMode {
    pub const ALL: [QuotingMode; 8] = [
        QuotingMode::Top,
        QuotingMode::Mid,
        QuotingMode::Join,
        QuotingMode::InverseJoin,
        QuotingMode::InverseTop,
        QuotingMode::PingPong,
        QuotingMode::Boomerang,
        QuotingMode::Ak47,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FairValueModel {
    #[serde(rename = "BBO")]
    Bbo,
    #[serde(rename = "wBBO")]
    WeightedBbo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingAt {
    BothSides,
    BidSide,
    AskSide,
    DepletedSide,
    DepletedBidSide,
    DepletedAskSide,
    StopPings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PongAt {
    ShortPingFair,
    LongPingFair,
    ShortPingAggressive,
    LongPingAggressive,
}

impl PongAt {
    pub fn is_short_ping(self) -> bool {
        matches!(self, PongAt::ShortPingFair | PongAt::ShortPingAggressive)
    }

    pub fn is_aggressive(self) -> bool {
        matches!(self, PongAt::ShortPingAggressive | PongAt::LongPingAggressive)
    }
}

/// Aggressive position rebalancing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Apr {
    Off,
    Size,
    SizeWidth,
}

/// Super-size on pressure: trade-count and/or size amplification while the book is wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuperTrades {
    Off,
    #[serde(rename = "x2trds")]
    X2Trades,
    #[serde(rename = "x3trds")]
    X3Trades,
    #[serde(rename = "x2Sz")]
    X2Size,
    #[serde(rename = "x3Sz")]
    X3Size,
    #[serde(rename = "x2trdsSz")]
    X2TradesSize,
    #[serde(rename = "x3trdsSz")]
    X3TradesSize,
}

impl SuperTrades {
    pub fn trades_multiplier(self) -> f64 {
        match self {
            SuperTrades::X2Trades | SuperTrades::X2TradesSize => 2.0,
            SuperTrades::X3Trades | SuperTrades::X3TradesSize => 3.0,
            _ => 1.0,
        }
    }

    pub fn size_multiplier(self) -> f64 {
        match self {
            SuperTrades::X2Size | SuperTrades::X2TradesSize => 2.0,
            SuperTrades::X3Size | SuperTrades::X3TradesSize => 3.0,
            _ => 1.0,
        }
    }
}

/// Trader-configured quoting parameters. Replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotingParameters {
    pub width_ping: f64,
    pub width_pong: f64,
    pub buy_size: f64,
    #[serde(default)]
    pub buy_size_percentage: f64,
    pub sell_size: f64,
    #[serde(default)]
    pub sell_size_percentage: f64,
    #[serde(default = "default_ping_at")]
    pub ping_at: PingAt,
    #[serde(default = "default_pong_at")]
    pub pong_at: PongAt,
    pub mode: QuotingMode,
    #[serde(default = "default_fv_model")]
    pub fv_model: FairValueModel,
    #[serde(default)]
    pub position_divergence: f64,
    #[serde(default)]
    pub position_divergence_percentage: f64,
    #[serde(default = "default_false")]
    pub percentage_values: bool,
    #[serde(default = "default_apr")]
    pub aggressive_position_rebalancing: Apr,
    #[serde(default = "default_super_trades")]
    pub super_trades: SuperTrades,
    #[serde(default = "default_trades_per_minute")]
    pub trades_per_minute: f64,
    #[serde(default = "default_trade_rate_seconds")]
    pub trade_rate_seconds: u64,
    #[serde(default = "default_false")]
    pub ewma_protection: bool,
    #[serde(default = "default_apr_multiplier")]
    pub apr_multiplier: f64,
    #[serde(default = "default_sop_width_multiplier")]
    pub sop_width_multiplier: f64,
    #[serde(default = "default_step_over_size")]
    pub step_over_size: f64,
}

fn default_false() -> bool {
    false
}

fn default_ping_at() -> PingAt {
    PingAt::BothSides
}

fn default_pong_at() -> PongAt {
    PongAt::ShortPingFair
}

fn default_fv_model() -> FairValueModel {
    FairValueModel::Bbo
}

fn default_apr() -> Apr {
    Apr::Off
}

fn default_super_trades() -> SuperTrades {
    SuperTrades::Off
}

fn default_trades_per_minute() -> f64 {
    0.9
}

fn default_trade_rate_seconds() -> u64 {
    69
}

fn default_apr_multiplier() -> f64 {
    2.0
}

fn default_sop_width_multiplier() -> f64 {
    2.0
}

fn default_step_over_size() -> f64 {
    1.0
}

impl Default for QuotingParameters {
    fn default() -> Self {
        Self {
            width_ping: 0.2,
            width_pong: 0.2,
            buy_size: 1.0,
            buy_size_percentage: 7.0,
            sell_size: 1.0,
            sell_size_percentage: 7.0,
            ping_at: default_ping_at(),
            pong_at: default_pong_at(),
            mode: QuotingMode::Mid,
            fv_model: default_fv_model(),
            position_divergence: 0.9,
            position_divergence_percentage: 21.0,
            percentage_values: false,
            aggressive_position_rebalancing: default_apr(),
            super_trades: default_super_trades(),
            trades_per_minute: default_trades_per_minute(),
            trade_rate_seconds: default_trade_rate_seconds(),
            ewma_protection: false,
            apr_multiplier: default_apr_multiplier(),
            sop_width_multiplier: default_sop_width_multiplier(),
            step_over_size: default_step_over_size(),
        }
    }
}

impl QuotingParameters {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut raw: toml::Value =
            toml::from_str(data).with_context(|| "Failed to parse TOML config")?;
        // Support nested [quoting] tables or top-level entries.
        let table = if let Some(table) = raw
            .get_mut("quoting")
            .and_then(|v| v.as_table_mut())
            .cloned()
        {
            table
        } else {
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("Invalid quoting config structure"))?
        };
        let mut cfg: QuotingParameters = toml::from_str(&toml::to_string(&table)?)
            .with_context(|| "Invalid quoting parameters")?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        // Each field can be overridden by `QUOTING_*` env vars.
        override_f64("QUOTING_WIDTH_PING", &mut self.width_ping);
        override_f64("QUOTING_WIDTH_PONG", &mut self.width_pong);
        override_f64("QUOTING_BUY_SIZE", &mut self.buy_size);
        override_f64("QUOTING_SELL_SIZE", &mut self.sell_size);
        override_f64(
            "QUOTING_BUY_SIZE_PERCENTAGE",
            &mut self.buy_size_percentage,
        );
        override_f64(
            "QUOTING_SELL_SIZE_PERCENTAGE",
            &mut self.sell_size_percentage,
        );
        override_f64(
            "QUOTING_POSITION_DIVERGENCE",
            &mut self.position_divergence,
        );
        override_f64(
            "QUOTING_POSITION_DIVERGENCE_PERCENTAGE",
            &mut self.position_divergence_percentage,
        );
        override_bool("QUOTING_PERCENTAGE_VALUES", &mut self.percentage_values);
        override_bool("QUOTING_EWMA_PROTECTION", &mut self.ewma_protection);
        override_f64("QUOTING_TRADES_PER_MINUTE", &mut self.trades_per_minute);
        override_u64("QUOTING_TRADE_RATE_SECONDS", &mut self.trade_rate_seconds);
        override_f64("QUOTING_APR_MULTIPLIER", &mut self.apr_multiplier);
        override_f64(
            "QUOTING_SOP_WIDTH_MULTIPLIER",
            &mut self.sop_width_multiplier,
        );
        override_f64("QUOTING_STEP_OVER_SIZE", &mut self.step_over_size);
        override_enum("QUOTING_MODE", &mut self.mode);
        override_enum("QUOTING_PING_AT", &mut self.ping_at);
        override_enum("QUOTING_PONG_AT", &mut self.pong_at);
        override_enum("QUOTING_APR", &mut self.aggressive_position_rebalancing);
        override_enum("QUOTING_SUPER_TRADES", &mut self.super_trades);
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.width_ping >= 0.0 && self.width_pong >= 0.0,
            "width_ping and width_pong must be non-negative"
        );
        anyhow::ensure!(
            self.buy_size >= 0.0 && self.sell_size >= 0.0,
            "buy_size and sell_size must be non-negative"
        );
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.buy_size_percentage)
                && (0.0..=100.0).contains(&self.sell_size_percentage),
            "size percentages must be within [0, 100]"
        );
        anyhow::ensure!(
            self.position_divergence >= 0.0,
            "position_divergence must be non-negative"
        );
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.position_divergence_percentage),
            "position_divergence_percentage must be within [0, 100]"
        );
        anyhow::ensure!(
            self.trade_rate_seconds > 0,
            "trade_rate_seconds must be greater than zero"
        );
        anyhow::ensure!(
            self.trades_per_minute >= 0.0,
            "trades_per_minute must be non-negative"
        );
        anyhow::ensure!(
            self.apr_multiplier >= 1.0,
            "apr_multiplier must be at least 1"
        );
        anyhow::ensure!(
            self.sop_width_multiplier >= 1.0,
            "sop_width_multiplier must be at least 1"
        );
        Ok(())
    }

    pub fn buy_size_for(&self, position: Option<&PositionReport>) -> f64 {
        match position {
            Some(report) if self.percentage_values => {
                self.buy_size_percentage * report.value / 100.0
            }
            _ => self.buy_size,
        }
    }

    pub fn sell_size_for(&self, position: Option<&PositionReport>) -> f64 {
        match position {
            Some(report) if self.percentage_values => {
                self.sell_size_percentage * report.value / 100.0
            }
            _ => self.sell_size,
        }
    }

    pub fn position_divergence_for(&self, position: &PositionReport) -> f64 {
        if self.percentage_values {
            self.position_divergence_percentage * position.value / 100.0
        } else {
            self.position_divergence
        }
    }

    /// `(trades, size)` multipliers; both 1 unless the book is wider than
    /// `width_ping * sop_width_multiplier`.
    pub fn super_trade_multipliers(&self, market: &Market) -> (f64, f64) {
        if self.super_trades == SuperTrades::Off {
            return (1.0, 1.0);
        }
        match market.spread() {
            Some(spread) if self.width_ping * self.sop_width_multiplier < spread => (
                self.super_trades.trades_multiplier(),
                self.super_trades.size_multiplier(),
            ),
            _ => (1.0, 1.0),
        }
    }

    pub fn is_ping_pong_mode(&self) -> bool {
        matches!(
            self.mode,
            QuotingMode::PingPong | QuotingMode::Boomerang | QuotingMode::Ak47
        )
    }

    /// Modes where the broker matches pongs against pings, so fully matched
    /// trades must not feed the ping/pong reference prices again.
    pub fn matches_pongs(&self) -> bool {
        matches!(self.mode, QuotingMode::Boomerang | QuotingMode::Ak47)
    }
}

fn override_f64(key: &str, field: &mut f64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f64>() {
            *field = parsed;
        }
    }
}

fn override_u64(key: &str, field: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u64>() {
            *field = parsed;
        }
    }
}

fn override_bool(key: &str, field: &mut bool) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<bool>() {
            *field = parsed;
        }
    }
}

fn override_enum<T: DeserializeOwned>(key: &str, field: &mut T) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = serde_json::from_value::<T>(serde_json::Value::String(value)) {
            *field = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quoting::types::MarketLevel;
    use chrono::Utc;
    use std::io::Write;
    use tempfile::tempdir;

    const NESTED: &str = r#"
[quoting]
width_ping = 0.5
width_pong = 0.3
buy_size = 0.02
sell_size = 0.03
mode = "PingPong"
pong_at = "LongPingAggressive"
super_trades = "x3trdsSz"
"#;

    #[test]
    fn test_nested_table() {
        let cfg = QuotingParameters::from_toml_str(NESTED).unwrap();
        assert_eq!(cfg.mode, QuotingMode::PingPong);
        assert_eq!(cfg.pong_at, PongAt::LongPingAggressive);
        assert_eq!(cfg.super_trades, SuperTrades::X3TradesSize);
        assert_eq!(cfg.width_ping, 0.5);
        assert_eq!(cfg.trade_rate_seconds, 69);
        assert_eq!(cfg.aggressive_position_rebalancing, Apr::Off);
    }

    #[test]
    fn test_top_level_entries_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quoting.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "width_ping = 1.0\nwidth_pong = 1.0\nbuy_size = 1.0\nsell_size = 1.0\nmode = \"AK47\"\nfv_model = \"wBBO\""
        )
        .unwrap();
        let cfg = QuotingParameters::from_file(&path).unwrap();
        assert_eq!(cfg.mode, QuotingMode::Ak47);
        assert_eq!(cfg.fv_model, FairValueModel::WeightedBbo);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = QuotingParameters::from_toml_str(
            "width_ping = -1.0\nwidth_pong = 0.1\nbuy_size = 1.0\nsell_size = 1.0\nmode = \"Mid\"",
        )
        .unwrap_err();
        assert!(err.to_string().contains("width_ping"));

        let mut params = QuotingParameters::default();
        params.trade_rate_seconds = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result = QuotingParameters::from_toml_str(
            "width_ping = 1.0\nwidth_pong = 1.0\nbuy_size = 1.0\nsell_size = 1.0\nmode = \"Sideways\"",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_enum_env_override() {
        let mut mode = QuotingMode::Mid;
        env::set_var("QUOTING_TEST_MODE_OVERRIDE", "Boomerang");
        override_enum("QUOTING_TEST_MODE_OVERRIDE", &mut mode);
        env::remove_var("QUOTING_TEST_MODE_OVERRIDE");
        assert_eq!(mode, QuotingMode::Boomerang);

        let mut untouched = SuperTrades::Off;
        env::set_var("QUOTING_TEST_SOP_OVERRIDE", "x9");
        override_enum("QUOTING_TEST_SOP_OVERRIDE", &mut untouched);
        env::remove_var("QUOTING_TEST_SOP_OVERRIDE");
        assert_eq!(untouched, SuperTrades::Off);
    }

    #[test]
    fn test_percentage_sizes() {
        let params = QuotingParameters {
            percentage_values: true,
            buy_size_percentage: 10.0,
            sell_size_percentage: 5.0,
            position_divergence_percentage: 20.0,
            ..QuotingParameters::default()
        };
        let report = PositionReport {
            base_amount: 1.0,
            quote_amount: 100.0,
            base_held_amount: 0.0,
            quote_held_amount: 0.0,
            value: 2.0,
            quote_value: 200.0,
            time: Utc::now(),
        };
        assert!((params.buy_size_for(Some(&report)) - 0.2).abs() < 1e-12);
        assert!((params.sell_size_for(Some(&report)) - 0.1).abs() < 1e-12);
        assert!((params.position_divergence_for(&report) - 0.4).abs() < 1e-12);
        // Without a report the absolute sizes apply.
        assert_eq!(params.buy_size_for(None), params.buy_size);
    }

    #[test]
    fn test_super_trade_multipliers() {
        let now = Utc::now();
        let wide = Market::new(
            vec![MarketLevel::new(99.0, 1.0)],
            vec![MarketLevel::new(101.0, 1.0)],
            now,
        );
        let narrow = Market::new(
            vec![MarketLevel::new(99.9, 1.0)],
            vec![MarketLevel::new(100.1, 1.0)],
            now,
        );
        let mut params = QuotingParameters {
            width_ping: 0.2,
            sop_width_multiplier: 2.0,
            super_trades: SuperTrades::X2TradesSize,
            ..QuotingParameters::default()
        };
        assert_eq!(params.super_trade_multipliers(&wide), (2.0, 2.0));
        assert_eq!(params.super_trade_multipliers(&narrow), (1.0, 1.0));
        assert_eq!(params.super_trade_multipliers(&Market::empty(now)), (1.0, 1.0));

        params.super_trades = SuperTrades::X3Trades;
        assert_eq!(params.super_trade_multipliers(&wide), (3.0, 1.0));
        params.super_trades = SuperTrades::X3Size;
        assert_eq!(params.super_trade_multipliers(&wide), (1.0, 3.0));
    }

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(99.904), 99.9);
        assert_eq!(round_to_tick(100.006), 100.01);
        assert_eq!(round_to_tick(0.004), 0.0);
    }
}
