//! 仓位与风控模块
//! 审核决策引擎给出的意图动作，越界即否决，并负责止损止盈与盈亏计算

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{EngineError, Result};
use crate::core::types::{realized_pnl, return_on_margin_pct, ClosedTrade, Position, Side};
use crate::utils::indicators::IndicatorSet;

/// 交易所允许的最大杠杆
pub const VENUE_MAX_LEVERAGE: u32 = 125;

fn default_trailing_threshold_pct() -> f64 {
    1.0
}

fn default_time_stop_min_profit_pct() -> f64 {
    1.0
}

fn default_max_pyramids() -> u32 {
    3
}

fn default_long_rsi_max() -> f64 {
    60.0
}

fn default_short_rsi_min() -> f64 {
    40.0
}

fn default_min_distance_atr() -> f64 {
    2.0
}

fn default_anchor_atr_mult() -> f64 {
    2.0
}

fn default_anchor_entry_pct() -> f64 {
    2.0
}

fn default_breakout_atr_mult() -> f64 {
    3.0
}

fn default_adx_threshold() -> f64 {
    30.0
}

/// 金字塔加仓配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_pyramids")]
    pub max_pyramids: u32,
    /// 多头加仓要求 RSI 低于该值
    #[serde(default = "default_long_rsi_max")]
    pub long_rsi_max: f64,
    /// 空头加仓要求 RSI 高于该值
    #[serde(default = "default_short_rsi_min")]
    pub short_rsi_min: f64,
    /// 与上次加仓价的最小间距（ATR 倍数）
    #[serde(default = "default_min_distance_atr")]
    pub min_distance_atr: f64,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_pyramids: default_max_pyramids(),
            long_rsi_max: default_long_rsi_max(),
            short_rsi_min: default_short_rsi_min(),
            min_distance_atr: default_min_distance_atr(),
        }
    }
}

/// ATR 止损配置：锚定止损与波动突破止损
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtrStopConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 锚定止损距最近高低点的 ATR 倍数
    #[serde(default = "default_anchor_atr_mult")]
    pub anchor_atr_mult: f64,
    /// 锚定止损相对开仓价的上限（百分比）
    #[serde(default = "default_anchor_entry_pct")]
    pub anchor_entry_pct: f64,
    /// 逆向波动超过该 ATR 倍数时止损
    #[serde(default = "default_breakout_atr_mult")]
    pub breakout_atr_mult: f64,
    /// 波动突破止损要求的最低 ADX
    #[serde(default = "default_adx_threshold")]
    pub adx_threshold: f64,
}

impl Default for AtrStopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            anchor_atr_mult: default_anchor_atr_mult(),
            anchor_entry_pct: default_anchor_entry_pct(),
            breakout_atr_mult: default_breakout_atr_mult(),
            adx_threshold: default_adx_threshold(),
        }
    }
}

/// 仓位计算方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// 固定仓位
    #[default]
    Fixed,
    /// 波动率越大仓位越小
    Volatility,
}

/// 风险配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RiskConfig {
    /// 开仓杠杆
    pub leverage: u32,
    /// 允许的最大杠杆
    pub max_leverage: u32,
    /// 开仓数量（合约张数/币数）
    pub position_size: f64,
    /// 所有交易对合计的最大持仓数
    pub max_positions: usize,
    /// 单笔 size × leverage 上限
    pub max_exposure: f64,
    /// 止损百分比
    pub stop_loss_pct: f64,
    /// 止盈百分比
    pub take_profit_pct: f64,
    /// 追踪止损启动阈值（相对开仓价的有利涨跌幅），0 表示关闭
    #[serde(default = "default_trailing_threshold_pct")]
    pub trailing_threshold_pct: f64,
    #[serde(default)]
    pub sizing: SizingMode,
    /// 持仓超过该小时数且收益不足时平仓
    #[serde(default)]
    pub max_holding_hours: Option<f64>,
    #[serde(default = "default_time_stop_min_profit_pct")]
    pub time_stop_min_profit_pct: f64,
    #[serde(default)]
    pub pyramid: PyramidConfig,
    #[serde(default)]
    pub atr_stops: AtrStopConfig,
}

impl RiskConfig {
    /// 校验风险参数，越界直接报错
    pub fn validate(&self) -> Result<()> {
        if self.max_leverage < 1 || self.max_leverage > VENUE_MAX_LEVERAGE {
            return Err(EngineError::config_invalid(
                "risk.max_leverage",
                format!("必须在 [1, {}] 区间内, 当前 {}", VENUE_MAX_LEVERAGE, self.max_leverage),
            ));
        }
        if self.leverage < 1 || self.leverage > self.max_leverage {
            return Err(EngineError::config_invalid(
                "risk.leverage",
                format!(
                    "必须在 [1, {}] 区间内, 当前 {}",
                    self.max_leverage, self.leverage
                ),
            ));
        }
        if !self.position_size.is_finite() || self.position_size <= 0.0 {
            return Err(EngineError::config_invalid(
                "risk.position_size",
                format!("必须为正数, 当前 {}", self.position_size),
            ));
        }
        if self.max_positions == 0 {
            return Err(EngineError::config_invalid(
                "risk.max_positions",
                "必须大于0",
            ));
        }
        if !self.max_exposure.is_finite() || self.max_exposure <= 0.0 {
            return Err(EngineError::config_invalid(
                "risk.max_exposure",
                format!("必须为正数, 当前 {}", self.max_exposure),
            ));
        }
        if self.position_size * self.leverage as f64 > self.max_exposure {
            return Err(EngineError::config_invalid(
                "risk.max_exposure",
                format!(
                    "position_size × leverage = {} 超过 max_exposure {}",
                    self.position_size * self.leverage as f64,
                    self.max_exposure
                ),
            ));
        }
        if !(self.stop_loss_pct > 0.0 && self.stop_loss_pct < 100.0) {
            return Err(EngineError::config_invalid(
                "risk.stop_loss_pct",
                format!("必须在 (0, 100) 区间内, 当前 {}", self.stop_loss_pct),
            ));
        }
        if !(self.take_profit_pct > 0.0) || !self.take_profit_pct.is_finite() {
            return Err(EngineError::config_invalid(
                "risk.take_profit_pct",
                format!("必须为正数, 当前 {}", self.take_profit_pct),
            ));
        }
        if !(self.trailing_threshold_pct >= 0.0) {
            return Err(EngineError::config_invalid(
                "risk.trailing_threshold_pct",
                "不能为负数",
            ));
        }
        if let Some(hours) = self.max_holding_hours {
            if !(hours > 0.0) {
                return Err(EngineError::config_invalid(
                    "risk.max_holding_hours",
                    "必须为正数",
                ));
            }
        }
        let pyramid = &self.pyramid;
        if !(0.0..=100.0).contains(&pyramid.long_rsi_max)
            || !(0.0..=100.0).contains(&pyramid.short_rsi_min)
        {
            return Err(EngineError::config_invalid(
                "risk.pyramid",
                "RSI 条件必须在 [0, 100] 区间内",
            ));
        }
        if !(pyramid.min_distance_atr >= 0.0) {
            return Err(EngineError::config_invalid(
                "risk.pyramid.min_distance_atr",
                "不能为负数",
            ));
        }
        let stops = &self.atr_stops;
        for (field, value) in [
            ("risk.atr_stops.anchor_atr_mult", stops.anchor_atr_mult),
            ("risk.atr_stops.anchor_entry_pct", stops.anchor_entry_pct),
            ("risk.atr_stops.breakout_atr_mult", stops.breakout_atr_mult),
        ] {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(EngineError::config_invalid(field, "必须为非负数"));
            }
        }
        if !(0.0..=100.0).contains(&stops.adx_threshold) {
            return Err(EngineError::config_invalid(
                "risk.atr_stops.adx_threshold",
                "必须在 [0, 100] 区间内",
            ));
        }
        Ok(())
    }
}

/// 平仓原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    TimeStop,
    Signal,
    /// 跌破（涨破）最近高低点外 N 倍 ATR
    AnchoredStop,
    /// 趋势明确时逆向波动超过 N 倍 ATR
    VolatilityStop,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CloseReason::StopLoss => write!(f, "止损"),
            CloseReason::TakeProfit => write!(f, "止盈"),
            CloseReason::TimeStop => write!(f, "时间止损"),
            CloseReason::Signal => write!(f, "策略信号"),
            CloseReason::AnchoredStop => write!(f, "锚定止损"),
            CloseReason::VolatilityStop => write!(f, "波动突破止损"),
        }
    }
}

/// 决策引擎给出的意图动作
#[derive(Debug, Clone, PartialEq)]
pub enum IntendedAction {
    Open {
        side: Side,
        size: f64,
        leverage: u32,
    },
    /// 平仓；reverse_to 表示平仓确认后再反向开仓
    Close {
        reason: CloseReason,
        reverse_to: Option<Side>,
    },
    AdjustStop {
        new_stop_loss: f64,
        trigger_price: f64,
    },
    /// 顺势加仓
    AddToPosition {
        size: f64,
    },
    Hold,
}

/// 风控审核通过的动作
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovedAction {
    Open {
        symbol: String,
        side: Side,
        size: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
    },
    Close {
        position_id: String,
        reason: CloseReason,
        reverse_to: Option<Side>,
    },
    AdjustStop {
        position_id: String,
        new_stop_loss: f64,
        trigger_price: f64,
    },
    AddToPosition {
        position_id: String,
        side: Side,
        size: f64,
    },
    Hold,
}

/// 否决原因，逐项对应被违反的约束
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VetoReason {
    PositionAlreadyOpen,
    MaxPositionsReached { open: usize, max: usize },
    ExposureExceeded { exposure: f64, max: f64 },
    LeverageOutOfRange { leverage: u32, max: u32 },
    InvalidSize(f64),
    InvalidPrice(f64),
    NoOpenPosition,
    StopNotTighter { current: f64, proposed: f64 },
    PyramidLimitReached { count: u32, max: u32 },
}

impl std::fmt::Display for VetoReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            VetoReason::PositionAlreadyOpen => write!(f, "该交易对已有持仓"),
            VetoReason::MaxPositionsReached { open, max } => {
                write!(f, "持仓数已达上限 {}/{}", open, max)
            }
            VetoReason::ExposureExceeded { exposure, max } => {
                write!(f, "敞口 size×leverage={:.6} 超过上限 {:.6}", exposure, max)
            }
            VetoReason::LeverageOutOfRange { leverage, max } => {
                write!(f, "杠杆 {}x 超出范围 [1, {}]", leverage, max)
            }
            VetoReason::InvalidSize(size) => write!(f, "无效仓位数量 {}", size),
            VetoReason::InvalidPrice(price) => write!(f, "无效参考价格 {}", price),
            VetoReason::NoOpenPosition => write!(f, "当前无持仓"),
            VetoReason::StopNotTighter { current, proposed } => {
                write!(f, "新止损 {:.4} 未优于当前止损 {:.4}", proposed, current)
            }
            VetoReason::PyramidLimitReached { count, max } => {
                write!(f, "加仓次数已达上限 {}/{}", count, max)
            }
        }
    }
}

/// 风控否决
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Veto {
    pub symbol: String,
    pub reason: VetoReason,
}

impl std::fmt::Display for Veto {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}: {}", self.symbol, self.reason)
    }
}

/// 仓位与风控管理器
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// 审核意图动作
    ///
    /// `open_positions` 是所有交易对当前的持仓总数，`reference_price` 用于预估止损止盈。
    pub fn review(
        &self,
        symbol: &str,
        action: &IntendedAction,
        position: Option<&Position>,
        open_positions: usize,
        reference_price: f64,
    ) -> std::result::Result<ApprovedAction, Veto> {
        let veto = |reason: VetoReason| {
            log::warn!("🛑 风控否决 {}: {}", symbol, reason);
            Veto {
                symbol: symbol.to_string(),
                reason,
            }
        };

        match action {
            IntendedAction::Hold => Ok(ApprovedAction::Hold),
            IntendedAction::Open {
                side,
                size,
                leverage,
            } => {
                if position.is_some() {
                    return Err(veto(VetoReason::PositionAlreadyOpen));
                }
                if open_positions >= self.config.max_positions {
                    return Err(veto(VetoReason::MaxPositionsReached {
                        open: open_positions,
                        max: self.config.max_positions,
                    }));
                }
                if *leverage < 1 || *leverage > self.config.max_leverage {
                    return Err(veto(VetoReason::LeverageOutOfRange {
                        leverage: *leverage,
                        max: self.config.max_leverage,
                    }));
                }
                if !size.is_finite() || *size <= 0.0 {
                    return Err(veto(VetoReason::InvalidSize(*size)));
                }
                let exposure = size * *leverage as f64;
                if exposure > self.config.max_exposure {
                    return Err(veto(VetoReason::ExposureExceeded {
                        exposure,
                        max: self.config.max_exposure,
                    }));
                }
                if !reference_price.is_finite() || reference_price <= 0.0 {
                    return Err(veto(VetoReason::InvalidPrice(reference_price)));
                }

                let (stop_loss, take_profit) = self.protective_prices(*side, reference_price);
                Ok(ApprovedAction::Open {
                    symbol: symbol.to_string(),
                    side: *side,
                    size: *size,
                    leverage: *leverage,
                    stop_loss,
                    take_profit,
                })
            }
            IntendedAction::Close { reason, reverse_to } => match position {
                Some(pos) => Ok(ApprovedAction::Close {
                    position_id: pos.id.clone(),
                    reason: *reason,
                    reverse_to: *reverse_to,
                }),
                None => Err(veto(VetoReason::NoOpenPosition)),
            },
            IntendedAction::AdjustStop {
                new_stop_loss,
                trigger_price,
            } => {
                let pos = position.ok_or_else(|| veto(VetoReason::NoOpenPosition))?;
                let tighter = match pos.side {
                    Side::Long => *new_stop_loss > pos.stop_loss,
                    Side::Short => *new_stop_loss < pos.stop_loss,
                };
                if !tighter || !new_stop_loss.is_finite() {
                    return Err(veto(VetoReason::StopNotTighter {
                        current: pos.stop_loss,
                        proposed: *new_stop_loss,
                    }));
                }
                Ok(ApprovedAction::AdjustStop {
                    position_id: pos.id.clone(),
                    new_stop_loss: *new_stop_loss,
                    trigger_price: *trigger_price,
                })
            }
            IntendedAction::AddToPosition { size } => {
                let pos = position.ok_or_else(|| veto(VetoReason::NoOpenPosition))?;
                let pyramid = &self.config.pyramid;
                let max = if pyramid.enabled { pyramid.max_pyramids } else { 0 };
                if pos.pyramids >= max {
                    return Err(veto(VetoReason::PyramidLimitReached {
                        count: pos.pyramids,
                        max,
                    }));
                }
                if !size.is_finite() || *size <= 0.0 {
                    return Err(veto(VetoReason::InvalidSize(*size)));
                }
                // 加仓后的整体敞口
                let exposure = (pos.size + size) * pos.leverage as f64;
                if exposure > self.config.max_exposure {
                    return Err(veto(VetoReason::ExposureExceeded {
                        exposure,
                        max: self.config.max_exposure,
                    }));
                }
                if !reference_price.is_finite() || reference_price <= 0.0 {
                    return Err(veto(VetoReason::InvalidPrice(reference_price)));
                }
                Ok(ApprovedAction::AddToPosition {
                    position_id: pos.id.clone(),
                    side: pos.side,
                    size: *size,
                })
            }
        }
    }

    /// 按开仓价计算止损止盈
    pub fn protective_prices(&self, side: Side, entry: f64) -> (f64, f64) {
        let sl = self.config.stop_loss_pct / 100.0;
        let tp = self.config.take_profit_pct / 100.0;
        match side {
            Side::Long => (entry * (1.0 - sl), entry * (1.0 + tp)),
            Side::Short => (entry * (1.0 + sl), entry * (1.0 - tp)),
        }
    }

    /// 计算追踪止损
    ///
    /// 价格创出新的有利极值且相对开仓价的涨跌幅超过阈值时，
    /// 以当前价重新计算止损，止损只会向有利方向移动。
    pub fn trailing_stop(&self, position: &Position, price: f64) -> Option<f64> {
        let threshold = self.config.trailing_threshold_pct;
        if threshold <= 0.0 || !price.is_finite() || price <= 0.0 {
            return None;
        }

        let new_extreme = match position.side {
            Side::Long => price > position.best_price,
            Side::Short => price < position.best_price,
        };
        if !new_extreme || position.price_return_pct(price) < threshold {
            return None;
        }

        let sl = self.config.stop_loss_pct / 100.0;
        let candidate = match position.side {
            Side::Long => price * (1.0 - sl),
            Side::Short => price * (1.0 + sl),
        };
        let tighter = match position.side {
            Side::Long => candidate > position.stop_loss,
            Side::Short => candidate < position.stop_loss,
        };
        tighter.then_some(candidate)
    }

    /// 锚定止损位
    ///
    /// 多头取 min(最近低点 − N×ATR, 开仓价 × (1 + p%))，空头镜像。
    pub fn anchored_stop(&self, position: &Position, ind: &IndicatorSet) -> f64 {
        let cfg = &self.config.atr_stops;
        let entry_cap = cfg.anchor_entry_pct / 100.0;
        match position.side {
            Side::Long => (ind.anchor_low - cfg.anchor_atr_mult * ind.atr)
                .min(position.entry_price * (1.0 + entry_cap)),
            Side::Short => (ind.anchor_high + cfg.anchor_atr_mult * ind.atr)
                .max(position.entry_price * (1.0 - entry_cap)),
        }
    }

    /// 检查 ATR 止损，锚定止损优先于波动突破止损
    pub fn atr_stop(&self, position: &Position, ind: &IndicatorSet) -> Option<CloseReason> {
        let cfg = &self.config.atr_stops;
        if !cfg.enabled || !(ind.atr > 0.0) {
            return None;
        }

        let anchor = self.anchored_stop(position, ind);
        let anchor_hit = match position.side {
            Side::Long => ind.price <= anchor,
            Side::Short => ind.price >= anchor,
        };
        if anchor_hit {
            log::debug!(
                "{} 价格 {:.4} 触及锚定止损 {:.4}",
                position.symbol,
                ind.price,
                anchor
            );
            return Some(CloseReason::AnchoredStop);
        }

        let adverse_move = (position.entry_price - ind.price) * position.side.sign();
        if adverse_move > cfg.breakout_atr_mult * ind.atr && ind.adx > cfg.adx_threshold {
            log::debug!(
                "{} 逆向波动 {:.4} 超过 {:.1}×ATR，ADX {:.2}",
                position.symbol,
                adverse_move,
                cfg.breakout_atr_mult,
                ind.adx
            );
            return Some(CloseReason::VolatilityStop);
        }
        None
    }

    /// 第 n+1 次加仓的数量，每次减半，最小 0.001
    pub fn pyramid_size(&self, position: &Position) -> f64 {
        let base = self.config.position_size * 0.5f64.powi(position.pyramids as i32 + 1);
        ((base * 1000.0).round() / 1000.0).max(0.001)
    }

    /// 检查加仓条件，满足时返回加仓数量
    ///
    /// 需要同时满足：RSI 未过热、价格创出回看窗口的新高（空头新低）、
    /// 与上次加仓价相距至少 N×ATR。
    pub fn pyramid_add(&self, position: &Position, ind: &IndicatorSet) -> Option<f64> {
        let cfg = &self.config.pyramid;
        if !cfg.enabled || position.pyramids >= cfg.max_pyramids {
            return None;
        }

        let (rsi_ok, new_extreme) = match position.side {
            Side::Long => (ind.rsi < cfg.long_rsi_max, ind.price > ind.prior_close_high),
            Side::Short => (ind.rsi > cfg.short_rsi_min, ind.price < ind.prior_close_low),
        };
        let spaced = match position.last_add_price {
            Some(last) => (ind.price - last).abs() >= cfg.min_distance_atr * ind.atr,
            None => true,
        };
        log::debug!(
            "{} 加仓条件: RSI={}, 新高/低={}, 间距={}",
            position.symbol,
            rsi_ok,
            new_extreme,
            spaced
        );

        (rsi_ok && new_extreme && spaced).then(|| self.pyramid_size(position))
    }

    /// 计算开仓数量
    pub fn position_size(&self, volatility_pct: f64) -> f64 {
        match self.config.sizing {
            SizingMode::Fixed => self.config.position_size,
            SizingMode::Volatility => self.volatility_adjusted_size(volatility_pct),
        }
    }

    /// 基于波动率的动态仓位计算
    fn volatility_adjusted_size(&self, volatility_pct: f64) -> f64 {
        let max_size = self.config.position_size;
        // 将波动率缩放到0-100
        let volatility_index = (volatility_pct * 10.0).clamp(0.0, 100.0);
        let base_size = max_size * 0.5;

        let size = base_size * (1.0 - (-0.03 * (100.0 - volatility_index)).exp());
        let size = size.clamp(max_size * 0.1, max_size);
        let rounded = (size * 1000.0).round() / 1000.0;

        log::debug!(
            "波动率指数: {:.2}, 计算的动态仓位大小: {}",
            volatility_index,
            rounded
        );
        // 取整后不能超过配置的仓位
        if rounded > max_size || rounded <= 0.0 {
            size
        } else {
            rounded
        }
    }

    /// 开仓成交后构建持仓，止损止盈与持仓同时生成
    pub fn build_position(
        &self,
        id: String,
        symbol: &str,
        side: Side,
        leverage: u32,
        fill_price: f64,
        filled_size: f64,
        opened_at: DateTime<Utc>,
    ) -> Position {
        let (stop_loss, take_profit) = self.protective_prices(side, fill_price);
        Position {
            id,
            symbol: symbol.to_string(),
            side,
            entry_price: fill_price,
            size: filled_size,
            leverage,
            stop_loss,
            take_profit,
            opened_at,
            best_price: fill_price,
            pyramids: 0,
            last_add_price: None,
        }
    }

    /// 平仓成交后计算已实现盈亏
    pub fn settle_close(
        &self,
        position: &Position,
        exit_price: f64,
        closed_size: f64,
        closed_at: DateTime<Utc>,
    ) -> ClosedTrade {
        let size = closed_size.min(position.size);
        let pnl = realized_pnl(position.side, position.entry_price, exit_price, size);
        ClosedTrade {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            entry_price: position.entry_price,
            exit_price,
            size,
            leverage: position.leverage,
            realized_pnl: pnl,
            return_on_margin_pct: return_on_margin_pct(
                pnl,
                position.entry_price,
                size,
                position.leverage,
            ),
            closed_at,
        }
    }
}
