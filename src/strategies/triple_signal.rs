//! 三重信号验证策略
//!
//! 趋势、动量、波动率三个子信号方向一致时才出信号：
//! - 趋势：快线相对慢线的位置
//! - 动量：RSI 位于趋势一侧，但未进入超买/超卖区
//! - 波动率：低波动震荡环境下价格相对布林中轨的位置
//!
//! 置信度为三个子信号强度的平均值。

use serde::{Deserialize, Serialize};

use crate::core::error::Result;
use crate::core::types::{Direction, Signal};
use crate::strategies::{invalid, StrategyKind};
use crate::utils::indicators::IndicatorSet;

fn default_rsi_mid() -> f64 {
    50.0
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_max_bb_width() -> f64 {
    0.1
}

fn default_max_atr_percent() -> f64 {
    2.0
}

fn default_trend_full_pct() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleSignalParams {
    #[serde(default = "default_rsi_mid")]
    pub rsi_mid: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    /// 布林带宽度上限，超过视为非震荡环境
    #[serde(default = "default_max_bb_width")]
    pub max_bb_width: f64,
    /// ATR 百分比上限
    #[serde(default = "default_max_atr_percent")]
    pub max_atr_percent: f64,
    /// 趋势强度满分对应的均线价差（百分比）
    #[serde(default = "default_trend_full_pct")]
    pub trend_full_pct: f64,
}

impl Default for TripleSignalParams {
    fn default() -> Self {
        Self {
            rsi_mid: default_rsi_mid(),
            rsi_overbought: default_rsi_overbought(),
            rsi_oversold: default_rsi_oversold(),
            max_bb_width: default_max_bb_width(),
            max_atr_percent: default_max_atr_percent(),
            trend_full_pct: default_trend_full_pct(),
        }
    }
}

impl TripleSignalParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.rsi_oversold
            && self.rsi_oversold < self.rsi_mid
            && self.rsi_mid < self.rsi_overbought
            && self.rsi_overbought < 100.0)
        {
            return Err(invalid(
                "triple_signal.rsi_mid",
                format!(
                    "需满足 0 < 超卖 {} < 中值 {} < 超买 {} < 100",
                    self.rsi_oversold, self.rsi_mid, self.rsi_overbought
                ),
            ));
        }
        if !(self.max_bb_width > 0.0) {
            return Err(invalid("triple_signal.max_bb_width", "必须为正数"));
        }
        if !(self.max_atr_percent > 0.0) {
            return Err(invalid("triple_signal.max_atr_percent", "必须为正数"));
        }
        if !(self.trend_full_pct > 0.0) {
            return Err(invalid("triple_signal.trend_full_pct", "必须为正数"));
        }
        Ok(())
    }

    pub(crate) fn set(&mut self, name: &str, value: f64) -> bool {
        match name {
            "rsi_mid" => self.rsi_mid = value,
            "rsi_overbought" => self.rsi_overbought = value,
            "rsi_oversold" => self.rsi_oversold = value,
            "max_bb_width" => self.max_bb_width = value,
            "max_atr_percent" => self.max_atr_percent = value,
            "trend_full_pct" => self.trend_full_pct = value,
            _ => return false,
        }
        true
    }
}

/// 子信号：方向 + 强度 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
struct SubSignal {
    direction: Direction,
    strength: f64,
}

impl SubSignal {
    fn flat() -> Self {
        Self {
            direction: Direction::Flat,
            strength: 0.0,
        }
    }
}

fn trend_signal(params: &TripleSignalParams, ind: &IndicatorSet) -> SubSignal {
    if ind.slow_ma <= 0.0 {
        return SubSignal::flat();
    }
    let spread = (ind.fast_ma - ind.slow_ma) / ind.slow_ma * 100.0;
    let strength = (spread.abs() / params.trend_full_pct).min(1.0);
    if spread > 0.0 {
        SubSignal {
            direction: Direction::Long,
            strength,
        }
    } else if spread < 0.0 {
        SubSignal {
            direction: Direction::Short,
            strength,
        }
    } else {
        SubSignal::flat()
    }
}

fn momentum_signal(params: &TripleSignalParams, ind: &IndicatorSet) -> SubSignal {
    if ind.rsi > params.rsi_mid && ind.rsi < params.rsi_overbought {
        SubSignal {
            direction: Direction::Long,
            strength: (ind.rsi - params.rsi_mid) / (params.rsi_overbought - params.rsi_mid),
        }
    } else if ind.rsi < params.rsi_mid && ind.rsi > params.rsi_oversold {
        SubSignal {
            direction: Direction::Short,
            strength: (params.rsi_mid - ind.rsi) / (params.rsi_mid - params.rsi_oversold),
        }
    } else {
        SubSignal::flat()
    }
}

fn volatility_signal(params: &TripleSignalParams, ind: &IndicatorSet) -> SubSignal {
    let calm = ind.bb_width <= params.max_bb_width && ind.atr_pct <= params.max_atr_percent;
    if !calm {
        return SubSignal::flat();
    }

    let half_band = ind.bb_upper - ind.bb_middle;
    let distance = ind.price - ind.bb_middle;
    let strength = if half_band > 0.0 {
        (distance.abs() / half_band).min(1.0)
    } else {
        1.0
    };
    if distance > 0.0 {
        SubSignal {
            direction: Direction::Long,
            strength,
        }
    } else if distance < 0.0 {
        SubSignal {
            direction: Direction::Short,
            strength,
        }
    } else {
        SubSignal::flat()
    }
}

pub fn evaluate(params: &TripleSignalParams, ind: &IndicatorSet) -> Signal {
    let id = StrategyKind::TripleSignal.id();
    let trend = trend_signal(params, ind);
    let momentum = momentum_signal(params, ind);
    let volatility = volatility_signal(params, ind);

    let agreed = trend.direction != Direction::Flat
        && trend.direction == momentum.direction
        && trend.direction == volatility.direction;
    if !agreed {
        return Signal::flat(
            id,
            ind.timestamp,
            format!(
                "子信号不一致: 趋势={:?} 动量={:?} 波动率={:?}",
                trend.direction, momentum.direction, volatility.direction
            ),
        );
    }

    let confidence = (trend.strength + momentum.strength + volatility.strength) / 3.0;
    Signal::new(
        trend.direction,
        confidence,
        id,
        ind.timestamp,
        format!(
            "三重信号确认 趋势{:.2} 动量{:.2} 波动率{:.2}",
            trend.strength, momentum.strength, volatility.strength
        ),
    )
}
