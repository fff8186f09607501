/// 统一日志管理模块
/// 基于 log4rs：控制台输出 + 按大小滚动的文件输出
use anyhow::Context;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub root_dir: String,
    pub file_name: String,
    pub default_level: String,
    pub max_file_size_mb: u64,
    /// 保留的滚动文件个数
    pub max_backups: u32,
    pub console_output: bool,
    pub pattern: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            root_dir: "logs".to_string(),
            file_name: "swapbot.log".to_string(),
            default_level: "INFO".to_string(),
            max_file_size_mb: 10,
            max_backups: 5,
            console_output: true,
            pattern: "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] [{M}] {m}{n}".to_string(),
        }
    }
}

impl LogConfig {
    /// 获取日志级别
    pub fn level_filter(&self) -> LevelFilter {
        match self.default_level.to_uppercase().as_str() {
            "TRACE" => LevelFilter::Trace,
            "DEBUG" => LevelFilter::Debug,
            "INFO" => LevelFilter::Info,
            "WARN" | "WARNING" => LevelFilter::Warn,
            "ERROR" => LevelFilter::Error,
            "OFF" => LevelFilter::Off,
            _ => LevelFilter::Info,
        }
    }
}

/// 构建 log4rs 配置
pub fn build_config(config: &LogConfig) -> anyhow::Result<Config> {
    let dir = Path::new(&config.root_dir);
    std::fs::create_dir_all(dir)
        .with_context(|| format!("创建日志目录 {} 失败", dir.display()))?;

    let log_path = dir.join(&config.file_name);
    let roll_pattern = dir.join(format!("{}.{{}}.gz", config.file_name));
    let roller = FixedWindowRoller::builder()
        .build(&roll_pattern.to_string_lossy(), config.max_backups.max(1))
        .context("创建日志滚动策略失败")?;
    let trigger = SizeTrigger::new(config.max_file_size_mb.max(1) * 1024 * 1024);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    let file = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(&config.pattern)))
        .build(&log_path, Box::new(policy))
        .with_context(|| format!("打开日志文件 {} 失败", log_path.display()))?;

    let mut builder =
        Config::builder().appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if config.console_output {
        let console = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(&config.pattern)))
            .build();
        builder = builder.appender(Appender::builder().build("console", Box::new(console)));
        root = root.appender("console");
    }

    // 第三方库只输出警告以上
    let builder = builder
        .logger(Logger::builder().build("reqwest", LevelFilter::Warn))
        .logger(Logger::builder().build("hyper", LevelFilter::Warn));

    builder
        .build(root.build(config.level_filter()))
        .context("日志配置无效")
}

/// 初始化全局日志
pub fn init_logger(config: &LogConfig) -> anyhow::Result<log4rs::Handle> {
    let log_config = build_config(config)?;
    let handle = log4rs::init_config(log_config).context("日志系统已初始化")?;
    log::info!(
        "📝 日志初始化完成，级别 {}，目录 {}",
        config.level_filter(),
        config.root_dir
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        let mut cfg = LogConfig::default();
        assert_eq!(cfg.level_filter(), LevelFilter::Info);
        cfg.default_level = "debug".to_string();
        assert_eq!(cfg.level_filter(), LevelFilter::Debug);
        cfg.default_level = "nonsense".to_string();
        assert_eq!(cfg.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn test_build_config_creates_directory() {
        let dir = std::env::temp_dir().join(format!("swapbot-logs-{}", std::process::id()));
        let cfg = LogConfig {
            root_dir: dir.to_string_lossy().to_string(),
            console_output: false,
            ..LogConfig::default()
        };
        assert!(build_config(&cfg).is_ok());
        assert!(dir.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
