//! 均值回归策略：RSI 上穿超买线做空、下穿超卖线做多，价格越出布林带时加强信号

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::{Direction, Signal};
use crate::strategies::{invalid, StrategyKind};
use crate::utils::indicators::IndicatorSet;

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_band_boost() -> f64 {
    0.3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanReversionParams {
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    /// 价格越出布林带时增加的置信度
    #[serde(default = "default_band_boost")]
    pub band_boost: f64,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        Self {
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            band_boost: default_band_boost(),
        }
    }
}

impl MeanReversionParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.rsi_oversold
            && self.rsi_oversold < self.rsi_overbought
            && self.rsi_overbought < 100.0)
        {
            return Err(invalid(
                "mean_reversion.rsi_overbought",
                format!(
                    "需满足 0 < 超卖 {} < 超买 {} < 100",
                    self.rsi_oversold, self.rsi_overbought
                ),
            ));
        }
        if !(0.0..=1.0).contains(&self.band_boost) {
            return Err(invalid("mean_reversion.band_boost", "必须在 [0, 1] 区间内"));
        }
        Ok(())
    }

    pub(crate) fn set(&mut self, name: &str, value: f64) -> bool {
        match name {
            "rsi_overbought" => self.rsi_overbought = value,
            "rsi_oversold" => self.rsi_oversold = value,
            "band_boost" => self.band_boost = value,
            _ => return false,
        }
        true
    }
}

pub fn evaluate(params: &MeanReversionParams, ind: &IndicatorSet) -> Signal {
    let id = StrategyKind::MeanReversion.id();

    // 只在穿越的那个周期出信号，停留在超买/超卖区间内不重复触发
    let crossed_above = ind.prev_rsi <= params.rsi_overbought && ind.rsi > params.rsi_overbought;
    let crossed_below = ind.prev_rsi >= params.rsi_oversold && ind.rsi < params.rsi_oversold;

    if crossed_above {
        let depth = (ind.rsi - params.rsi_overbought) / (100.0 - params.rsi_overbought);
        let outside_band = ind.price >= ind.bb_upper;
        let boost = if outside_band { params.band_boost } else { 0.0 };
        Signal::new(
            Direction::Short,
            0.5 + 0.5 * depth + boost,
            id,
            ind.timestamp,
            format!(
                "RSI上穿超买线 {:.2} -> {:.2}{}",
                ind.prev_rsi,
                ind.rsi,
                if outside_band { "，价格高于布林上轨" } else { "" }
            ),
        )
    } else if crossed_below {
        let depth = (params.rsi_oversold - ind.rsi) / params.rsi_oversold;
        let outside_band = ind.price <= ind.bb_lower;
        let boost = if outside_band { params.band_boost } else { 0.0 };
        Signal::new(
            Direction::Long,
            0.5 + 0.5 * depth + boost,
            id,
            ind.timestamp,
            format!(
                "RSI下穿超卖线 {:.2} -> {:.2}{}",
                ind.prev_rsi,
                ind.rsi,
                if outside_band { "，价格低于布林下轨" } else { "" }
            ),
        )
    } else {
        Signal::flat(
            id,
            ind.timestamp,
            format!("RSI {:.2} -> {:.2} 未穿越阈值", ind.prev_rsi, ind.rsi),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::neutral_set;

    #[test]
    fn test_overbought_is_short_oversold_is_long() {
        let params = MeanReversionParams::default();
        let mut set = neutral_set();

        set.rsi = 75.0;
        assert_eq!(evaluate(&params, &set).direction, Direction::Short);

        set.rsi = 25.0;
        assert_eq!(evaluate(&params, &set).direction, Direction::Long);

        set.rsi = 50.0;
        assert!(evaluate(&params, &set).is_flat());
    }

    #[test]
    fn test_already_overbought_stays_flat() {
        let params = MeanReversionParams::default();
        let mut set = neutral_set();

        set.prev_rsi = 80.0;
        set.rsi = 82.0;
        assert!(evaluate(&params, &set).is_flat());

        set.prev_rsi = 20.0;
        set.rsi = 18.0;
        assert!(evaluate(&params, &set).is_flat());
    }

    #[test]
    fn test_crossing_fires_once_then_rearms() {
        let params = MeanReversionParams::default();
        let mut set = neutral_set();

        // 68 -> 72 上穿
        set.prev_rsi = 68.0;
        set.rsi = 72.0;
        assert_eq!(evaluate(&params, &set).direction, Direction::Short);

        // 继续停留在 70 上方
        set.prev_rsi = 72.0;
        set.rsi = 75.0;
        assert!(evaluate(&params, &set).is_flat());

        // 回落到 70 下方后再次上穿
        set.prev_rsi = 75.0;
        set.rsi = 65.0;
        assert!(evaluate(&params, &set).is_flat());
        set.prev_rsi = 65.0;
        set.rsi = 71.0;
        assert_eq!(evaluate(&params, &set).direction, Direction::Short);

        // 超卖方向对称
        set.prev_rsi = 31.0;
        set.rsi = 28.0;
        assert_eq!(evaluate(&params, &set).direction, Direction::Long);
        set.prev_rsi = 28.0;
        set.rsi = 25.0;
        assert!(evaluate(&params, &set).is_flat());
    }

    #[test]
    fn test_touching_threshold_counts_as_inside() {
        let params = MeanReversionParams::default();
        let mut set = neutral_set();

        set.prev_rsi = 70.0;
        set.rsi = 70.5;
        assert_eq!(evaluate(&params, &set).direction, Direction::Short);

        set.prev_rsi = 65.0;
        set.rsi = 70.0;
        assert!(evaluate(&params, &set).is_flat());
    }

    #[test]
    fn test_band_confirmation_raises_confidence() {
        let params = MeanReversionParams::default();
        let mut set = neutral_set();
        set.rsi = 75.0;
        let inside = evaluate(&params, &set);

        set.price = 105.0;
        let outside = evaluate(&params, &set);
        assert!(outside.confidence > inside.confidence);
    }
}
