use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 持仓方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// 多头为 +1，空头为 -1
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// 信号方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    pub fn as_side(&self) -> Option<Side> {
        match self {
            Direction::Long => Some(Side::Long),
            Direction::Short => Some(Side::Short),
            Direction::Flat => None,
        }
    }
}

impl From<Side> for Direction {
    fn from(side: Side) -> Self {
        match side {
            Side::Long => Direction::Long,
            Side::Short => Direction::Short,
        }
    }
}

/// K线
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// 行情快照，产生后不可变，只会被下一个快照取代
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub last_price: f64,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub candles: Vec<Candle>,
}

impl MarketSnapshot {
    /// 只有价格的简化快照
    pub fn from_price(symbol: &str, timestamp: DateTime<Utc>, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            timestamp,
            last_price: price,
            bid: price,
            ask: price,
            volume: 0.0,
            candles: Vec::new(),
        }
    }

    pub fn latest_candle(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// 策略信号，每个周期重新生成，不会被修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Direction,
    /// 置信度 0.0 ~ 1.0
    pub confidence: f64,
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    /// 只平仓不反手
    #[serde(default)]
    pub exit_only: bool,
    #[serde(default)]
    pub reason: String,
}

impl Signal {
    pub fn flat(strategy: &str, timestamp: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            direction: Direction::Flat,
            confidence: 0.0,
            strategy: strategy.to_string(),
            timestamp,
            exit_only: false,
            reason: reason.into(),
        }
    }

    pub fn new(
        direction: Direction,
        confidence: f64,
        strategy: &str,
        timestamp: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            strategy: strategy.to_string(),
            timestamp,
            exit_only: false,
            reason: reason.into(),
        }
    }

    pub fn exit(self) -> Self {
        Self {
            exit_only: true,
            ..self
        }
    }

    pub fn is_flat(&self) -> bool {
        self.direction == Direction::Flat
    }
}

/// 持仓
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub leverage: u32,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    /// 开仓以来最有利的价格（多头取最高，空头取最低）
    pub best_price: f64,
    /// 已加仓次数
    #[serde(default)]
    pub pyramids: u32,
    /// 最近一次加仓的成交价
    #[serde(default)]
    pub last_add_price: Option<f64>,
}

impl Position {
    /// 检查是否触及止损
    pub fn is_stop_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price <= self.stop_loss,
            Side::Short => price >= self.stop_loss,
        }
    }

    /// 检查是否触及止盈
    pub fn is_take_profit_hit(&self, price: f64) -> bool {
        match self.side {
            Side::Long => price >= self.take_profit,
            Side::Short => price <= self.take_profit,
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        realized_pnl(self.side, self.entry_price, price, self.size)
    }

    /// 未计杠杆的价格收益百分比
    pub fn price_return_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0 * self.side.sign()
    }

    /// 获取持仓小时数
    pub fn holding_hours(&self, now: DateTime<Utc>) -> f64 {
        let duration = now - self.opened_at;
        duration.num_seconds() as f64 / 3600.0
    }
}

/// 已实现盈亏: (exit − entry) × size × 方向符号
pub fn realized_pnl(side: Side, entry: f64, exit: f64, size: f64) -> f64 {
    (exit - entry) * size * side.sign()
}

/// 保证金收益率（计入杠杆）
pub fn return_on_margin_pct(pnl: f64, entry: f64, size: f64, leverage: u32) -> f64 {
    let margin = entry * size / leverage.max(1) as f64;
    if margin <= 0.0 {
        return 0.0;
    }
    pnl / margin * 100.0
}

/// 平仓记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub leverage: u32,
    pub realized_pnl: f64,
    pub return_on_margin_pct: f64,
    pub closed_at: DateTime<Utc>,
}

/// 下单结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderResult {
    Confirmed { fill_price: f64, filled_size: f64 },
    Rejected(String),
    Timeout,
}

impl OrderResult {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, OrderResult::Confirmed { .. })
    }

    pub fn failure_reason(&self) -> Option<String> {
        match self {
            OrderResult::Confirmed { .. } => None,
            OrderResult::Rejected(reason) => Some(format!("下单被拒绝: {}", reason)),
            OrderResult::Timeout => Some("下单超时".to_string()),
        }
    }
}

/// 账户余额
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub total: f64,
    pub available: f64,
}
