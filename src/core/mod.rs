// 核心模块 - 配置、错误、领域类型、风控与外部接口
pub mod config;
pub mod error;
pub mod exchange;
pub mod risk_manager;
pub mod types;

pub use config::*;
pub use error::*;
pub use exchange::*;
pub use risk_manager::{
    ApprovedAction, CloseReason, IntendedAction, RiskConfig, RiskManager, SizingMode, Veto,
    VetoReason,
};
pub use types::{
    Balance, Candle, ClosedTrade, Direction, MarketSnapshot, OrderResult, Position, Side, Signal,
};
