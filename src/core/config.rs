use serde::{Deserialize, Serialize};

use crate::core::error::{EngineError, Result};
use crate::core::risk_manager::RiskConfig;
use crate::strategies::StrategySettings;
use crate::utils::indicators::IndicatorConfig;
use crate::utils::unified_logger::LogConfig;
use crate::utils::webhook::NotifierConfig;

/// 环境变量覆盖前缀，例如 SWAPBOT__RISK__LEVERAGE=5
pub const ENV_PREFIX: &str = "SWAPBOT";

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_report_interval_secs() -> u64 {
    86_400
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_execution_timeout_secs() -> u64 {
    30
}

fn default_notify_timeout_secs() -> u64 {
    5
}

fn default_min_reverse_confidence() -> f64 {
    0.6
}

fn default_snapshot_buffer() -> usize {
    64
}

fn default_replay_dir() -> String {
    "data".to_string()
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_currency() -> String {
    "USDT".to_string()
}

/// 进程级配置，启动时加载一次，运行期间只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub strategy: StrategySettings,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// 交易对列表，例如 BTC-USDT-SWAP
    pub symbols: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// 仓位报告间隔，0 表示不发送
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

/// 决策引擎参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// 执行失败后的冷却时间
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_notify_timeout_secs")]
    pub notify_timeout_secs: u64,
    /// 开仓所需的最低置信度
    #[serde(default)]
    pub min_open_confidence: f64,
    /// 反手所需的最低置信度
    #[serde(default = "default_min_reverse_confidence")]
    pub min_reverse_confidence: f64,
    /// 等待执行期间缓存的行情快照数量
    #[serde(default = "default_snapshot_buffer")]
    pub snapshot_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            execution_timeout_secs: default_execution_timeout_secs(),
            notify_timeout_secs: default_notify_timeout_secs(),
            min_open_confidence: 0.0,
            min_reverse_confidence: default_min_reverse_confidence(),
            snapshot_buffer: default_snapshot_buffer(),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.execution_timeout_secs == 0 {
            return Err(EngineError::config_invalid(
                "engine.execution_timeout_secs",
                "必须大于0",
            ));
        }
        if self.notify_timeout_secs == 0 {
            return Err(EngineError::config_invalid(
                "engine.notify_timeout_secs",
                "必须大于0",
            ));
        }
        if self.snapshot_buffer == 0 {
            return Err(EngineError::config_invalid(
                "engine.snapshot_buffer",
                "必须大于0",
            ));
        }
        for (field, value) in [
            ("engine.min_open_confidence", self.min_open_confidence),
            ("engine.min_reverse_confidence", self.min_reverse_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::config_invalid(
                    field,
                    format!("必须在 [0, 1] 区间内, 当前 {}", value),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// 回放数据目录，每个交易对一个 <symbol>.jsonl 文件
    #[serde(default = "default_replay_dir")]
    pub replay_dir: String,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            replay_dir: default_replay_dir(),
        }
    }
}

/// 模拟盘参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            currency: default_currency(),
        }
    }
}

impl AppConfig {
    /// 从YAML文件加载配置，环境变量可覆盖任意字段
    pub fn from_file(path: &str) -> Result<Self> {
        dotenv::dotenv().ok(); // 加载.env文件，忽略错误

        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app: AppConfig = settings.try_deserialize()?;
        app.notifier = app.notifier.with_env_credentials();
        app.validate()?;
        Ok(app)
    }

    /// 从YAML字符串解析（不读取环境变量）
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let app: AppConfig = serde_yaml::from_str(contents)?;
        app.validate()?;
        Ok(app)
    }

    /// 校验全部参数，越界直接报错，不做截断
    pub fn validate(&self) -> Result<()> {
        if self.trading.symbols.is_empty() {
            return Err(EngineError::config_invalid(
                "trading.symbols",
                "至少需要一个交易对",
            ));
        }
        if self.trading.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(EngineError::config_invalid(
                "trading.symbols",
                "交易对不能为空字符串",
            ));
        }
        if self.trading.poll_interval_secs == 0 {
            return Err(EngineError::config_invalid(
                "trading.poll_interval_secs",
                "必须大于0",
            ));
        }
        if self.paper.initial_balance < 0.0 {
            return Err(EngineError::config_invalid(
                "paper.initial_balance",
                "不能为负数",
            ));
        }

        self.risk.validate()?;
        self.indicators.validate()?;
        self.strategy.validate()?;
        self.engine.validate()?;
        self.notifier.validate()?;
        // 通知必须在引擎的等待时限前完成落盘，否则事件会被丢弃
        if self.notifier.delivery_budget_ms >= self.engine.notify_timeout_secs * 1000 {
            return Err(EngineError::config_invalid(
                "notifier.delivery_budget_ms",
                format!(
                    "必须小于 engine.notify_timeout_secs ({}s)",
                    self.engine.notify_timeout_secs
                ),
            ));
        }
        Ok(())
    }
}
