/// 技术指标模块
/// 静态指标函数 + 基于滚动窗口的指标引擎
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::core::error::{EngineError, Result};
use crate::core::types::MarketSnapshot;

/// legacy 策略检查连续下跌需要的收盘价个数
pub const RECENT_CLOSES: usize = 4;

/// 静态技术指标计算函数（无状态）
pub mod functions {
    /// 计算简单移动平均线 (SMA)
    pub fn sma(prices: &[f64], period: usize) -> Option<f64> {
        if prices.len() < period || period == 0 {
            return None;
        }

        let sum: f64 = prices[prices.len() - period..].iter().sum();
        Some(sum / period as f64)
    }

    /// 计算相对强弱指数 (RSI)，窗口内完全无波动时返回中性值50
    pub fn rsi(prices: &[f64], period: usize) -> Option<f64> {
        if prices.len() < period + 1 || period == 0 {
            return None;
        }

        let mut gains = 0.0;
        let mut losses = 0.0;

        for i in prices.len() - period..prices.len() {
            let change = prices[i] - prices[i - 1];
            if change > 0.0 {
                gains += change;
            } else {
                losses += change.abs();
            }
        }

        if gains == 0.0 && losses == 0.0 {
            return Some(50.0);
        }

        let avg_gain = gains / period as f64;
        let avg_loss = losses / period as f64;

        if avg_loss == 0.0 {
            return Some(100.0);
        }

        let rs = avg_gain / avg_loss;
        Some(100.0 - (100.0 / (1.0 + rs)))
    }

    /// 总体标准差
    pub fn std_dev(prices: &[f64], period: usize) -> Option<f64> {
        let mean = sma(prices, period)?;
        let variance: f64 = prices[prices.len() - period..]
            .iter()
            .map(|p| (p - mean).powi(2))
            .sum::<f64>()
            / period as f64;
        Some(variance.sqrt())
    }

    /// 计算布林带 (upper, middle, lower)
    pub fn bollinger_bands(prices: &[f64], period: usize, std_dev_k: f64) -> Option<(f64, f64, f64)> {
        let middle = sma(prices, period)?;
        let std = std_dev(prices, period)?;
        Some((middle + std_dev_k * std, middle, middle - std_dev_k * std))
    }

    /// 计算平均真实范围 (ATR)，取最近 period 个真实波幅的简单平均
    pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
        let n = closes.len();
        if period == 0 || n < period + 1 || highs.len() != n || lows.len() != n {
            return None;
        }

        let sum: f64 = (n - period..n)
            .map(|i| {
                let high_low = highs[i] - lows[i];
                let high_close = (highs[i] - closes[i - 1]).abs();
                let low_close = (lows[i] - closes[i - 1]).abs();
                high_low.max(high_close).max(low_close)
            })
            .sum();

        Some(sum / period as f64)
    }

    /// 平均绝对涨跌幅（百分比）
    pub fn mean_abs_pct_change(prices: &[f64], window: usize) -> Option<f64> {
        if window == 0 || prices.len() < window + 1 {
            return None;
        }

        let n = prices.len();
        let sum: f64 = (n - window..n)
            .map(|i| ((prices[i] - prices[i - 1]) / prices[i - 1] * 100.0).abs())
            .sum();
        Some(sum / window as f64)
    }

    /// 平均趋向指数 (ADX)
    ///
    /// DI 取最近 period 步的简单累加，ADX 为最近 period 个 DX 的平均值。
    pub fn adx(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Option<f64> {
        let n = closes.len();
        if period == 0 || n < 2 * period + 1 || highs.len() != n || lows.len() != n {
            return None;
        }

        // (真实波幅, +DM, -DM)
        let steps: Vec<(f64, f64, f64)> = (1..n)
            .map(|i| {
                let up = highs[i] - highs[i - 1];
                let down = lows[i - 1] - lows[i];
                let plus_dm = if up > down && up > 0.0 { up } else { 0.0 };
                let minus_dm = if down > up && down > 0.0 { down } else { 0.0 };
                let tr = (highs[i] - lows[i])
                    .max((highs[i] - closes[i - 1]).abs())
                    .max((lows[i] - closes[i - 1]).abs());
                (tr, plus_dm, minus_dm)
            })
            .collect();

        let m = steps.len();
        let dx_sum: f64 = (m - period..m)
            .map(|end| {
                let window = &steps[end + 1 - period..=end];
                let tr: f64 = window.iter().map(|s| s.0).sum();
                if tr <= 0.0 {
                    return 0.0;
                }
                let di_plus = 100.0 * window.iter().map(|s| s.1).sum::<f64>() / tr;
                let di_minus = 100.0 * window.iter().map(|s| s.2).sum::<f64>() / tr;
                let di_sum = di_plus + di_minus;
                if di_sum <= 0.0 {
                    0.0
                } else {
                    100.0 * (di_plus - di_minus).abs() / di_sum
                }
            })
            .sum();

        Some(dx_sum / period as f64)
    }

    /// 当前样本之前 window 个样本的最高价与最低价
    pub fn breakout_levels(highs: &[f64], lows: &[f64], window: usize) -> Option<(f64, f64)> {
        let n = highs.len();
        if window == 0 || n < window + 1 || lows.len() != n {
            return None;
        }

        let range = n - 1 - window..n - 1;
        let high = highs[range.clone()]
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        let low = lows[range].iter().cloned().fold(f64::INFINITY, f64::min);
        Some((high, low))
    }
}

fn default_ma_fast() -> usize {
    9
}

fn default_ma_slow() -> usize {
    21
}

fn default_rsi_period() -> usize {
    14
}

fn default_volatility_window() -> usize {
    20
}

fn default_atr_period() -> usize {
    14
}

fn default_bollinger_period() -> usize {
    20
}

fn default_bollinger_std_dev() -> f64 {
    2.0
}

fn default_breakout_window() -> usize {
    50
}

fn default_adx_period() -> usize {
    14
}

fn default_anchor_window() -> usize {
    3
}

fn default_extreme_window() -> usize {
    10
}

/// 指标窗口配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_ma_fast")]
    pub ma_fast: usize,
    #[serde(default = "default_ma_slow")]
    pub ma_slow: usize,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_bollinger_period")]
    pub bollinger_period: usize,
    #[serde(default = "default_bollinger_std_dev")]
    pub bollinger_std_dev: f64,
    #[serde(default = "default_breakout_window")]
    pub breakout_window: usize,
    #[serde(default = "default_adx_period")]
    pub adx_period: usize,
    /// 锚定止损参考的K线个数（不含当前）
    #[serde(default = "default_anchor_window")]
    pub anchor_window: usize,
    /// 加仓判断新高/新低时回看的收盘价个数（不含当前）
    #[serde(default = "default_extreme_window")]
    pub extreme_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            ma_fast: default_ma_fast(),
            ma_slow: default_ma_slow(),
            rsi_period: default_rsi_period(),
            volatility_window: default_volatility_window(),
            atr_period: default_atr_period(),
            bollinger_period: default_bollinger_period(),
            bollinger_std_dev: default_bollinger_std_dev(),
            breakout_window: default_breakout_window(),
            adx_period: default_adx_period(),
            anchor_window: default_anchor_window(),
            extreme_window: default_extreme_window(),
        }
    }
}

impl IndicatorConfig {
    pub fn validate(&self) -> Result<()> {
        let windows = [
            ("indicators.ma_fast", self.ma_fast),
            ("indicators.ma_slow", self.ma_slow),
            ("indicators.rsi_period", self.rsi_period),
            ("indicators.volatility_window", self.volatility_window),
            ("indicators.atr_period", self.atr_period),
            ("indicators.bollinger_period", self.bollinger_period),
            ("indicators.breakout_window", self.breakout_window),
            ("indicators.adx_period", self.adx_period),
            ("indicators.anchor_window", self.anchor_window),
            ("indicators.extreme_window", self.extreme_window),
        ];
        for (field, value) in windows {
            if value == 0 {
                return Err(EngineError::config_invalid(field, "窗口长度必须大于0"));
            }
        }
        if self.ma_fast >= self.ma_slow {
            return Err(EngineError::config_invalid(
                "indicators.ma_fast",
                format!("快线周期 {} 必须小于慢线周期 {}", self.ma_fast, self.ma_slow),
            ));
        }
        if !(self.bollinger_std_dev > 0.0) {
            return Err(EngineError::config_invalid(
                "indicators.bollinger_std_dev",
                "必须为正数",
            ));
        }
        Ok(())
    }

    /// 产出完整指标集所需的最少样本数，同时也是滚动缓冲区长度
    pub fn min_samples(&self) -> usize {
        [
            self.ma_slow + 1, // 需要上一周期的均线判断交叉
            self.rsi_period + 2,
            self.volatility_window + 1,
            self.atr_period + 1,
            self.bollinger_period,
            self.breakout_window + 1,
            2 * self.adx_period + 1,
            self.anchor_window + 1,
            self.extreme_window + 1,
            RECENT_CLOSES,
        ]
        .into_iter()
        .max()
        .unwrap_or(1)
    }
}

/// 指标快照，由滚动窗口确定性地推导，不持久化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub fast_ma: f64,
    pub slow_ma: f64,
    pub prev_fast_ma: f64,
    pub prev_slow_ma: f64,
    pub rsi: f64,
    pub prev_rsi: f64,
    /// 平均绝对涨跌幅（百分比）
    pub volatility_pct: f64,
    pub atr: f64,
    pub atr_pct: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    pub bb_width: f64,
    pub breakout_high: f64,
    pub breakout_low: f64,
    pub adx: f64,
    /// 当前样本之前 anchor_window 根K线的最高价与最低价
    pub anchor_high: f64,
    pub anchor_low: f64,
    /// 当前样本之前 extreme_window 个收盘价的最高与最低
    pub prior_close_high: f64,
    pub prior_close_low: f64,
    /// 最近的收盘价，时间正序
    pub recent_closes: Vec<f64>,
}

/// 指标引擎输出
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorReading {
    Ready(IndicatorSet),
    /// 样本不足，尚不能给出完整指标
    InsufficientData { have: usize, need: usize },
    /// 快照无效被丢弃
    Dropped(String),
}

impl IndicatorReading {
    pub fn ready(&self) -> Option<&IndicatorSet> {
        match self {
            IndicatorReading::Ready(set) => Some(set),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Sample {
    timestamp: DateTime<Utc>,
    high: f64,
    low: f64,
    close: f64,
}

/// 指标引擎：维护有界滚动窗口，每个新快照重新计算指标
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    config: IndicatorConfig,
    symbol: String,
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl IndicatorEngine {
    pub fn new(symbol: &str, config: IndicatorConfig) -> Self {
        let capacity = config.min_samples();
        Self {
            config,
            symbol: symbol.to_string(),
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn min_samples(&self) -> usize {
        self.capacity
    }

    /// 追加快照并重新计算
    pub fn update(&mut self, snapshot: &MarketSnapshot) -> IndicatorReading {
        if let Err(reason) = self.validate(snapshot) {
            log::warn!("⚠️ 丢弃无效行情 {}: {}", self.symbol, reason);
            return IndicatorReading::Dropped(reason);
        }

        let close = snapshot.last_price;
        let (high, low) = match snapshot.latest_candle() {
            Some(c) if c.high.is_finite() && c.low.is_finite() && c.high >= c.low => {
                (c.high.max(close), c.low.min(close))
            }
            _ => (close, close),
        };

        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            timestamp: snapshot.timestamp,
            high,
            low,
            close,
        });

        self.compute()
    }

    fn validate(&self, snapshot: &MarketSnapshot) -> std::result::Result<(), String> {
        if snapshot.symbol != self.symbol {
            return Err(format!(
                "交易对不匹配: 期望 {}, 实际 {}",
                self.symbol, snapshot.symbol
            ));
        }
        if !snapshot.last_price.is_finite() || snapshot.last_price <= 0.0 {
            return Err(format!("价格无效: {}", snapshot.last_price));
        }
        if let Some(last) = self.samples.back() {
            if snapshot.timestamp <= last.timestamp {
                return Err(format!(
                    "时间戳乱序: {} <= {}",
                    snapshot.timestamp, last.timestamp
                ));
            }
        }
        Ok(())
    }

    fn compute(&self) -> IndicatorReading {
        let have = self.samples.len();
        let need = self.capacity;
        if have < need {
            return IndicatorReading::InsufficientData { have, need };
        }

        match self.build_set() {
            Some(set) => IndicatorReading::Ready(set),
            None => IndicatorReading::InsufficientData { have, need },
        }
    }

    fn build_set(&self) -> Option<IndicatorSet> {
        use functions::*;

        let cfg = &self.config;
        let closes: Vec<f64> = self.samples.iter().map(|s| s.close).collect();
        let highs: Vec<f64> = self.samples.iter().map(|s| s.high).collect();
        let lows: Vec<f64> = self.samples.iter().map(|s| s.low).collect();
        let prev = &closes[..closes.len() - 1];
        let last = self.samples.back()?;

        let (bb_upper, bb_middle, bb_lower) =
            bollinger_bands(&closes, cfg.bollinger_period, cfg.bollinger_std_dev)?;
        let (breakout_high, breakout_low) = breakout_levels(&highs, &lows, cfg.breakout_window)?;
        let atr = atr(&highs, &lows, &closes, cfg.atr_period)?;
        let (anchor_high, anchor_low) = breakout_levels(&highs, &lows, cfg.anchor_window)?;
        let (prior_close_high, prior_close_low) =
            breakout_levels(&closes, &closes, cfg.extreme_window)?;

        Some(IndicatorSet {
            timestamp: last.timestamp,
            price: last.close,
            fast_ma: sma(&closes, cfg.ma_fast)?,
            slow_ma: sma(&closes, cfg.ma_slow)?,
            prev_fast_ma: sma(prev, cfg.ma_fast)?,
            prev_slow_ma: sma(prev, cfg.ma_slow)?,
            rsi: rsi(&closes, cfg.rsi_period)?,
            prev_rsi: rsi(prev, cfg.rsi_period)?,
            volatility_pct: mean_abs_pct_change(&closes, cfg.volatility_window)?,
            atr,
            atr_pct: atr / last.close * 100.0,
            bb_upper,
            bb_middle,
            bb_lower,
            bb_width: if bb_middle > 0.0 {
                (bb_upper - bb_lower) / bb_middle
            } else {
                0.0
            },
            breakout_high,
            breakout_low,
            adx: adx(&highs, &lows, &closes, cfg.adx_period)?,
            anchor_high,
            anchor_low,
            prior_close_high,
            prior_close_low,
            recent_closes: closes[closes.len() - RECENT_CLOSES..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::functions::*;
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn small_config() -> IndicatorConfig {
        IndicatorConfig {
            ma_fast: 3,
            ma_slow: 5,
            rsi_period: 4,
            volatility_window: 4,
            atr_period: 3,
            bollinger_period: 5,
            bollinger_std_dev: 2.0,
            breakout_window: 5,
            adx_period: 2,
            anchor_window: 3,
            extreme_window: 3,
        }
    }

    fn snapshot(i: i64, price: f64) -> MarketSnapshot {
        let t0 = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        MarketSnapshot::from_price("BTC-USDT-SWAP", t0 + Duration::minutes(i), price)
    }

    #[test]
    fn test_sma() {
        let prices = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&prices, 3);
        assert!((result.unwrap() - 4.0).abs() < 0.001); // (3+4+5)/3 = 4
        assert_eq!(sma(&prices, 6), None);
    }

    #[test]
    fn test_rsi() {
        let prices = vec![
            44.0, 44.25, 44.50, 43.75, 44.65, 45.12, 45.84, 46.08, 45.89, 46.03, 45.61, 46.28,
            46.28, 46.00, 46.03, 46.41, 46.22, 45.64,
        ];
        let rsi_val = rsi(&prices, 14).unwrap();
        assert!(rsi_val >= 0.0 && rsi_val <= 100.0);

        assert_eq!(rsi(&[1.0, 2.0, 3.0, 4.0], 3), Some(100.0));
        assert_eq!(rsi(&[2.0, 2.0, 2.0, 2.0], 3), Some(50.0));
    }

    #[test]
    fn test_bollinger_bands() {
        let prices = vec![20.0, 21.0, 22.0, 21.5, 20.5, 21.0, 22.0, 23.0, 22.5, 21.5];
        let (upper, middle, lower) = bollinger_bands(&prices, 5, 2.0).unwrap();
        assert!(upper > middle);
        assert!(middle > lower);
    }

    #[test]
    fn test_atr() {
        let highs = vec![48.70, 48.72, 48.90, 48.87, 48.82];
        let lows = vec![47.79, 48.14, 48.39, 48.37, 48.24];
        let closes = vec![48.16, 48.61, 48.75, 48.63, 48.74];
        let result = atr(&highs, &lows, &closes, 3);
        assert!(result.unwrap() > 0.0);
    }

    #[test]
    fn test_breakout_levels_exclude_current_sample() {
        let highs = vec![10.0, 12.0, 11.0, 50.0];
        let lows = vec![9.0, 8.0, 10.0, 1.0];
        assert_eq!(breakout_levels(&highs, &lows, 3), Some((12.0, 8.0)));
    }

    #[test]
    fn test_adx_tracks_trend_strength() {
        // 单边上涨：-DM 恒为0，DX 全部为100
        let closes: Vec<f64> = (0..9).map(|i| 100.0 + i as f64).collect();
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();
        let trending = adx(&highs, &lows, &closes, 4).unwrap();
        assert!((trending - 100.0).abs() < 1e-9);

        // 来回震荡，方向相互抵消
        let closes = vec![100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0, 101.0, 100.0];
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();
        let choppy = adx(&highs, &lows, &closes, 4).unwrap();
        assert!(choppy < trending);
        assert!(choppy < 30.0);

        assert_eq!(adx(&highs[..8], &lows[..8], &closes[..8], 4), None);
    }

    #[test]
    fn test_mean_abs_pct_change() {
        let prices = vec![100.0, 101.0, 100.0];
        let v = mean_abs_pct_change(&prices, 2).unwrap();
        assert!((v - (1.0 + 100.0 / 101.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_engine_becomes_ready_after_min_samples() {
        let cfg = small_config();
        let need = cfg.min_samples();
        let mut engine = IndicatorEngine::new("BTC-USDT-SWAP", cfg);

        for i in 0..need as i64 - 1 {
            let reading = engine.update(&snapshot(i, 100.0 + i as f64));
            assert!(matches!(reading, IndicatorReading::InsufficientData { .. }));
        }
        let reading = engine.update(&snapshot(need as i64, 200.0));
        let set = reading.ready().expect("ready");
        assert_eq!(set.price, 200.0);
        assert!(set.fast_ma > set.slow_ma);
        assert_eq!(set.recent_closes.len(), RECENT_CLOSES);
        assert!(set.breakout_high < 200.0);
        assert!(set.anchor_high < 200.0);
        assert!(set.prior_close_high < 200.0);
        assert!(set.adx >= 0.0 && set.adx <= 100.0);
        assert_eq!(engine.len(), need);
    }

    #[test]
    fn test_engine_drops_invalid_snapshots() {
        let mut engine = IndicatorEngine::new("BTC-USDT-SWAP", small_config());
        engine.update(&snapshot(5, 100.0));

        assert!(matches!(
            engine.update(&snapshot(6, 0.0)),
            IndicatorReading::Dropped(_)
        ));
        assert!(matches!(
            engine.update(&snapshot(6, f64::NAN)),
            IndicatorReading::Dropped(_)
        ));
        // 时间戳乱序
        assert!(matches!(
            engine.update(&snapshot(4, 100.0)),
            IndicatorReading::Dropped(_)
        ));
        let mut other = snapshot(7, 100.0);
        other.symbol = "ETH-USDT-SWAP".to_string();
        assert!(matches!(engine.update(&other), IndicatorReading::Dropped(_)));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = small_config();
        cfg.ma_fast = 5;
        assert!(cfg.validate().is_err());
        let mut cfg = small_config();
        cfg.rsi_period = 0;
        assert!(cfg.validate().is_err());
    }

    proptest! {
        #[test]
        fn short_sequences_never_produce_partial_sets(
            prices in proptest::collection::vec(0.01f64..100_000.0, 0..51)
        ) {
            let cfg = IndicatorConfig::default();
            prop_assume!(prices.len() < cfg.min_samples());
            let mut engine = IndicatorEngine::new("BTC-USDT-SWAP", cfg);
            for (i, price) in prices.iter().enumerate() {
                let reading = engine.update(&snapshot(i as i64, *price));
                let is_insufficient = matches!(reading, IndicatorReading::InsufficientData { .. });
                prop_assert!(is_insufficient);
            }
        }
    }
}
