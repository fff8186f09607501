//! 趋势跟踪策略：快慢均线价差超过阈值时顺势开仓

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::{Direction, Signal};
use crate::strategies::{invalid, StrategyKind};
use crate::utils::indicators::IndicatorSet;

fn default_threshold_pct() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendFollowingParams {
    /// 快慢线价差阈值（百分比），区间内为死区
    #[serde(default = "default_threshold_pct")]
    pub threshold_pct: f64,
}

impl Default for TrendFollowingParams {
    fn default() -> Self {
        Self {
            threshold_pct: default_threshold_pct(),
        }
    }
}

impl TrendFollowingParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold_pct > 0.0) {
            return Err(invalid("trend_following.threshold_pct", "必须为正数"));
        }
        Ok(())
    }

    pub(crate) fn set(&mut self, name: &str, value: f64) -> bool {
        match name {
            "threshold_pct" => self.threshold_pct = value,
            _ => return false,
        }
        true
    }
}

pub fn evaluate(params: &TrendFollowingParams, ind: &IndicatorSet) -> Signal {
    let id = StrategyKind::TrendFollowing.id();
    if ind.slow_ma <= 0.0 {
        return Signal::flat(id, ind.timestamp, "慢线无效");
    }

    let spread = (ind.fast_ma - ind.slow_ma) / ind.slow_ma * 100.0;
    // 价差达到两倍阈值时置信度为1
    let confidence = (spread.abs() / (2.0 * params.threshold_pct)).min(1.0);

    if spread > params.threshold_pct {
        Signal::new(
            Direction::Long,
            confidence,
            id,
            ind.timestamp,
            format!("快线高于慢线 {:.2}%", spread),
        )
    } else if spread < -params.threshold_pct {
        Signal::new(
            Direction::Short,
            confidence,
            id,
            ind.timestamp,
            format!("快线低于慢线 {:.2}%", spread.abs()),
        )
    } else {
        Signal::flat(id, ind.timestamp, format!("价差 {:.2}% 处于死区", spread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::test_support::neutral_set;

    fn params(threshold_pct: f64) -> TrendFollowingParams {
        TrendFollowingParams { threshold_pct }
    }

    #[test]
    fn test_long_when_spread_above_threshold() {
        let mut set = neutral_set();
        set.fast_ma = 105.0;
        set.slow_ma = 100.0;
        let signal = evaluate(&params(2.0), &set);
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.confidence, 1.0);
    }

    #[test]
    fn test_short_when_spread_below_negative_threshold() {
        let mut set = neutral_set();
        set.fast_ma = 97.0;
        set.slow_ma = 100.0;
        assert_eq!(evaluate(&params(2.0), &set).direction, Direction::Short);
    }

    #[test]
    fn test_dead_zone_is_flat() {
        let mut set = neutral_set();
        set.fast_ma = 101.5;
        set.slow_ma = 100.0;
        assert!(evaluate(&params(2.0), &set).is_flat());
        set.fast_ma = 102.0;
        assert!(evaluate(&params(2.0), &set).is_flat());
    }
}
