//! 波动率突破策略：价格突破前 N 根的最高/最低价

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::{Direction, Signal};
use crate::strategies::{invalid, StrategyKind};
use crate::utils::indicators::IndicatorSet;

fn default_margin_pct() -> f64 {
    0.1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutParams {
    /// 突破幅度需超过该百分比
    #[serde(default = "default_margin_pct")]
    pub margin_pct: f64,
}

impl Default for BreakoutParams {
    fn default() -> Self {
        Self {
            margin_pct: default_margin_pct(),
        }
    }
}

impl BreakoutParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.margin_pct >= 0.0) {
            return Err(invalid("volatility_breakout.margin_pct", "不能为负数"));
        }
        Ok(())
    }

    pub(crate) fn set(&mut self, name: &str, value: f64) -> bool {
        match name {
            "margin_pct" => self.margin_pct = value,
            _ => return false,
        }
        true
    }
}

/// 突破幅度相对 ATR% 越大置信度越高，最低 0.5
fn breakout_confidence(excess_pct: f64, atr_pct: f64) -> f64 {
    if atr_pct <= 0.0 {
        return 1.0;
    }
    0.5 + 0.5 * (excess_pct / atr_pct).min(1.0)
}

pub fn evaluate(params: &BreakoutParams, ind: &IndicatorSet) -> Signal {
    let id = StrategyKind::VolatilityBreakout.id();
    if ind.breakout_high <= 0.0 || ind.breakout_low <= 0.0 {
        return Signal::flat(id, ind.timestamp, "突破区间无效");
    }

    let above_pct = (ind.price - ind.breakout_high) / ind.breakout_high * 100.0;
    let below_pct = (ind.breakout_low - ind.price) / ind.breakout_low * 100.0;

    if above_pct > params.margin_pct {
        Signal::new(
            Direction::Long,
            breakout_confidence(above_pct, ind.atr_pct),
            id,
            ind.timestamp,
            format!("向上突破 {:.4}，幅度 {:.2}%", ind.breakout_high, above_pct),
        )
    } else if below_pct > params.margin_pct {
        Signal::new(
            Direction::Short,
            breakout_confidence(below_pct, ind.atr_pct),
            id,
            ind.timestamp,
            format!("向下突破 {:.4}，幅度 {:.2}%", ind.breakout_low, below_pct),
        )
    } else {
        Signal::flat(id, ind.timestamp, "价格处于突破区间内")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::neutral_set;

    #[test]
    fn test_breakout_up_and_down() {
        let params = BreakoutParams { margin_pct: 0.1 };
        let mut set = neutral_set();

        set.price = 106.0;
        let up = evaluate(&params, &set);
        assert_eq!(up.direction, Direction::Long);
        assert!(up.confidence >= 0.5);

        set.price = 94.0;
        assert_eq!(evaluate(&params, &set).direction, Direction::Short);
    }

    #[test]
    fn test_margin_must_be_exceeded() {
        let params = BreakoutParams { margin_pct: 1.0 };
        let mut set = neutral_set();
        // 105 × 1.01 = 106.05
        set.price = 106.0;
        assert!(evaluate(&params, &set).is_flat());
        set.price = 100.0;
        assert!(evaluate(&params, &set).is_flat());
    }
}
