//! 信号策略
//!
//! 五种策略组成封闭的集合，全部是 (指标集, 当前持仓) 的纯函数，
//! 由 `StrategyKind` 做穷尽分派。

pub mod mean_reversion;
pub mod oscillation_decline;
pub mod trend_following;
pub mod triple_signal;
pub mod volatility_breakout;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::core::error::{EngineError, Result};
use crate::core::types::{Position, Signal};
use crate::utils::indicators::IndicatorSet;

pub use mean_reversion::MeanReversionParams;
pub use oscillation_decline::OscillationDeclineParams;
pub use trend_following::TrendFollowingParams;
pub use triple_signal::TripleSignalParams;
pub use volatility_breakout::BreakoutParams;

/// 策略类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// 三重信号验证
    #[default]
    TripleSignal,
    /// 波动率突破
    VolatilityBreakout,
    /// 趋势跟踪
    TrendFollowing,
    /// 均值回归
    MeanReversion,
    /// 原始震荡下跌策略
    Original,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 5] = [
        StrategyKind::TripleSignal,
        StrategyKind::VolatilityBreakout,
        StrategyKind::TrendFollowing,
        StrategyKind::MeanReversion,
        StrategyKind::Original,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            StrategyKind::TripleSignal => "triple_signal",
            StrategyKind::VolatilityBreakout => "volatility_breakout",
            StrategyKind::TrendFollowing => "trend_following",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Original => "original",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            StrategyKind::TripleSignal => "三重信号验证策略",
            StrategyKind::VolatilityBreakout => "波动率突破策略",
            StrategyKind::TrendFollowing => "趋势跟踪策略",
            StrategyKind::MeanReversion => "均值回归策略",
            StrategyKind::Original => "原始震荡下跌策略",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for StrategyKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.id() == s.trim())
            .ok_or_else(|| EngineError::UnknownStrategy(s.to_string()))
    }
}

/// 各策略的可调参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyParams {
    #[serde(default)]
    pub triple_signal: TripleSignalParams,
    #[serde(default)]
    pub volatility_breakout: BreakoutParams,
    #[serde(default)]
    pub trend_following: TrendFollowingParams,
    #[serde(default)]
    pub mean_reversion: MeanReversionParams,
    #[serde(default)]
    pub original: OscillationDeclineParams,
}

/// 策略状态：当前策略 + 全部参数，只通过操作员命令修改
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategySettings {
    #[serde(default)]
    pub active: StrategyKind,
    #[serde(default)]
    pub params: StrategyParams,
}

impl StrategySettings {
    pub fn new(active: StrategyKind) -> Self {
        Self {
            active,
            params: StrategyParams::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.params.triple_signal.validate()?;
        self.params.volatility_breakout.validate()?;
        self.params.trend_following.validate()?;
        self.params.mean_reversion.validate()?;
        self.params.original.validate()?;
        Ok(())
    }

    /// 用当前策略评估指标
    pub fn evaluate(&self, indicators: &IndicatorSet, position: Option<&Position>) -> Signal {
        evaluate(self.active, &self.params, indicators, position)
    }

    /// 设置策略参数
    ///
    /// `key` 可以是 `<策略>.<参数>`，也可以只写参数名（作用于当前策略）。
    /// 新值校验失败时保持原参数不变。
    pub fn set_param(&mut self, key: &str, value: f64) -> Result<()> {
        let (kind, name) = match key.split_once('.') {
            Some((strategy, name)) => (strategy.parse::<StrategyKind>()?, name),
            None => (self.active, key),
        };
        if !value.is_finite() {
            return Err(EngineError::InvalidParameter {
                key: key.to_string(),
                reason: format!("参数值无效: {}", value),
            });
        }

        let mut params = self.params.clone();
        let applied = match kind {
            StrategyKind::TripleSignal => params.triple_signal.set(name, value),
            StrategyKind::VolatilityBreakout => params.volatility_breakout.set(name, value),
            StrategyKind::TrendFollowing => params.trend_following.set(name, value),
            StrategyKind::MeanReversion => params.mean_reversion.set(name, value),
            StrategyKind::Original => params.original.set(name, value),
        };
        if !applied {
            return Err(EngineError::InvalidParameter {
                key: key.to_string(),
                reason: format!("{} 没有参数 {}", kind.id(), name),
            });
        }

        let candidate = StrategySettings {
            active: self.active,
            params,
        };
        candidate.validate().map_err(|e| EngineError::InvalidParameter {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.params = candidate.params;
        Ok(())
    }
}

/// 按策略类型分派
pub fn evaluate(
    kind: StrategyKind,
    params: &StrategyParams,
    indicators: &IndicatorSet,
    position: Option<&Position>,
) -> Signal {
    match kind {
        StrategyKind::TripleSignal => triple_signal::evaluate(&params.triple_signal, indicators),
        StrategyKind::VolatilityBreakout => {
            volatility_breakout::evaluate(&params.volatility_breakout, indicators)
        }
        StrategyKind::TrendFollowing => {
            trend_following::evaluate(&params.trend_following, indicators)
        }
        StrategyKind::MeanReversion => mean_reversion::evaluate(&params.mean_reversion, indicators),
        StrategyKind::Original => oscillation_decline::evaluate(&params.original, indicators, position),
    }
}

pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> EngineError {
    EngineError::config_invalid(format!("strategy.params.{}", field), reason)
}
