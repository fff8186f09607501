// 决策引擎与持仓管理
pub mod decision;
pub mod engine;
pub mod handle;
pub mod position_book;

pub use decision::{decide, EngineState};
pub use engine::{spawn_feed, EngineContext, TradingEngine};
pub use handle::{EngineCommand, EngineHandle, EngineStatus};
pub use position_book::PositionBook;
