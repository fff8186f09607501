// 工具模块 - 指标、日志、通知、报告
pub mod indicators;
pub mod position_reporter;
pub mod unified_logger;
pub mod webhook;

pub use indicators::{IndicatorConfig, IndicatorEngine, IndicatorReading, IndicatorSet};
pub use position_reporter::PositionReporter;
pub use unified_logger::{init_logger, LogConfig};
pub use webhook::{Notifier, NotifierConfig, TradeEvent, WebhookNotifier};
