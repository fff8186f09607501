//! 决策规则：把信号和持仓状态转换为意图动作
//!
//! 优先级：止损 > 止盈 > ATR 止损 > 时间止损 > 反向信号平仓 > 加仓 > 追踪止损 > 开仓 > 观望

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::EngineSettings;
use crate::core::risk_manager::{CloseReason, IntendedAction, RiskManager};
use crate::core::types::{Position, Signal};
use crate::utils::indicators::IndicatorSet;

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Evaluating,
    AwaitingExecution,
    Cooldown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EngineState::Idle => write!(f, "空闲"),
            EngineState::Evaluating => write!(f, "评估中"),
            EngineState::AwaitingExecution => write!(f, "等待成交"),
            EngineState::Cooldown => write!(f, "冷却中"),
        }
    }
}

/// 根据当前指标、信号与持仓给出意图动作
pub fn decide(
    risk: &RiskManager,
    settings: &EngineSettings,
    signal: &Signal,
    ind: &IndicatorSet,
    position: Option<&Position>,
    now: DateTime<Utc>,
) -> IntendedAction {
    match position {
        Some(pos) => manage_position(risk, settings, signal, ind, pos, now),
        None => {
            let Some(side) = signal.direction.as_side() else {
                return IntendedAction::Hold;
            };
            if signal.exit_only || signal.confidence < settings.min_open_confidence {
                return IntendedAction::Hold;
            }
            IntendedAction::Open {
                side,
                size: risk.position_size(ind.volatility_pct),
                leverage: risk.config().leverage,
            }
        }
    }
}

fn manage_position(
    risk: &RiskManager,
    settings: &EngineSettings,
    signal: &Signal,
    ind: &IndicatorSet,
    pos: &Position,
    now: DateTime<Utc>,
) -> IntendedAction {
    let price = ind.price;
    // 止损止盈优先于任何信号
    if pos.is_stop_hit(price) {
        return IntendedAction::Close {
            reason: CloseReason::StopLoss,
            reverse_to: None,
        };
    }
    if pos.is_take_profit_hit(price) {
        return IntendedAction::Close {
            reason: CloseReason::TakeProfit,
            reverse_to: None,
        };
    }

    if let Some(reason) = risk.atr_stop(pos, ind) {
        return IntendedAction::Close {
            reason,
            reverse_to: None,
        };
    }

    let cfg = risk.config();
    if let Some(max_hours) = cfg.max_holding_hours {
        if pos.holding_hours(now) > max_hours
            && pos.price_return_pct(price) < cfg.time_stop_min_profit_pct
        {
            return IntendedAction::Close {
                reason: CloseReason::TimeStop,
                reverse_to: None,
            };
        }
    }

    if let Some(side) = signal.direction.as_side() {
        if side == pos.side.opposite() && signal.confidence >= settings.min_reverse_confidence {
            return IntendedAction::Close {
                reason: CloseReason::Signal,
                reverse_to: if signal.exit_only { None } else { Some(side) },
            };
        }
    }

    if let Some(size) = risk.pyramid_add(pos, ind) {
        return IntendedAction::AddToPosition { size };
    }

    if let Some(new_stop_loss) = risk.trailing_stop(pos, price) {
        return IntendedAction::AdjustStop {
            new_stop_loss,
            trigger_price: price,
        };
    }

    IntendedAction::Hold
}
