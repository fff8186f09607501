//! 原始震荡下跌策略（只做空）
//!
//! 空仓时：(RSI 在超买区回落 或 快线下穿慢线 或 价格触及布林上轨) 且此前连续下跌，开空。
//! 持空仓时：RSI 低于超卖线或价格触及布林下轨，平空。
//! 持多仓时：直接给出平仓信号。
//! 平仓信号都只平不反手。

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::{Direction, Position, Side, Signal};
use crate::strategies::{invalid, StrategyKind};
use crate::utils::indicators::IndicatorSet;

fn default_rsi_overbought() -> f64 {
    60.0
}

fn default_rsi_oversold() -> f64 {
    40.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OscillationDeclineParams {
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
}

impl Default for OscillationDeclineParams {
    fn default() -> Self {
        Self {
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
        }
    }
}

impl OscillationDeclineParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.rsi_oversold
            && self.rsi_oversold < self.rsi_overbought
            && self.rsi_overbought < 100.0)
        {
            return Err(invalid(
                "original.rsi_overbought",
                format!(
                    "需满足 0 < 超卖 {} < 超买 {} < 100",
                    self.rsi_oversold, self.rsi_overbought
                ),
            ));
        }
        Ok(())
    }

    pub(crate) fn set(&mut self, name: &str, value: f64) -> bool {
        match name {
            "rsi_overbought" => self.rsi_overbought = value,
            "rsi_oversold" => self.rsi_oversold = value,
            _ => return false,
        }
        true
    }
}

/// 当前K线之前的三根收盘价逐根下跌
fn is_declining(closes: &[f64]) -> bool {
    if closes.len() < 4 {
        return false;
    }
    let prior = &closes[closes.len() - 4..closes.len() - 1];
    prior.windows(2).all(|w| w[1] < w[0])
}

pub fn evaluate(
    params: &OscillationDeclineParams,
    ind: &IndicatorSet,
    position: Option<&Position>,
) -> Signal {
    let id = StrategyKind::Original.id();

    match position.map(|p| p.side) {
        Some(Side::Short) => {
            let rsi_exit = ind.rsi < params.rsi_oversold;
            let band_exit = ind.price <= ind.bb_lower;
            if rsi_exit || band_exit {
                Signal::new(
                    Direction::Long,
                    1.0,
                    id,
                    ind.timestamp,
                    format!("平空条件: RSI={:.2} 触及下轨={}", ind.rsi, band_exit),
                )
                .exit()
            } else {
                Signal::flat(id, ind.timestamp, "持有空仓")
            }
        }
        Some(Side::Long) => {
            Signal::new(Direction::Short, 1.0, id, ind.timestamp, "只做空策略，平掉多仓").exit()
        }
        None => {
            // 条件1: RSI回落，超买区域
            let rsi_condition = ind.rsi < ind.prev_rsi && ind.rsi > params.rsi_overbought;
            // 条件2: 快线下穿慢线
            let ma_cross = ind.prev_fast_ma > ind.prev_slow_ma && ind.fast_ma < ind.slow_ma;
            // 条件3: 价格触及上轨
            let bb_condition = ind.price >= ind.bb_upper;
            let downtrend = is_declining(&ind.recent_closes);

            if (rsi_condition || ma_cross || bb_condition) && downtrend {
                Signal::new(
                    Direction::Short,
                    1.0,
                    id,
                    ind.timestamp,
                    format!(
                        "震荡下跌: RSI回落={} 均线下穿={} 触及上轨={}",
                        rsi_condition, ma_cross, bb_condition
                    ),
                )
            } else {
                Signal::flat(id, ind.timestamp, "观察市场中")
            }
        }
    }
}
