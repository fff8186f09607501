use thiserror::Error;

use crate::core::risk_manager::Veto;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("数据不足: 已有 {have} 个样本, 需要 {need} 个")]
    InsufficientData { have: usize, need: usize },

    #[error("风控否决: {0}")]
    RiskVeto(Veto),

    #[error("执行失败: {0}")]
    ExecutionFailure(String),

    #[error("配置无效: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    #[error("配置加载错误: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("YAML配置错误: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("JSON序列化错误: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("行情数据错误: {0}")]
    MarketData(String),

    #[error("行情数据已结束: {0}")]
    FeedExhausted(String),

    #[error("未知策略: {0}")]
    UnknownStrategy(String),

    #[error("参数错误: {key} - {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("引擎已停止")]
    EngineStopped,
}

impl EngineError {
    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 判断错误是否会终止进程
    ///
    /// 只有启动阶段的配置错误是致命的，其余错误都只影响当前周期。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ConfigInvalid { .. }
                | EngineError::ConfigLoad(_)
                | EngineError::YamlError(_)
        )
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EngineError::InsufficientData { .. } => ErrorSeverity::Info,
            EngineError::MarketData(_) => ErrorSeverity::Warning,
            EngineError::FeedExhausted(_) => ErrorSeverity::Info,
            EngineError::RiskVeto(_) => ErrorSeverity::Warning,
            EngineError::ExecutionFailure(_) => ErrorSeverity::Error,
            EngineError::UnknownStrategy(_) | EngineError::InvalidParameter { .. } => {
                ErrorSeverity::Warning
            }
            EngineError::ConfigInvalid { .. }
            | EngineError::ConfigLoad(_)
            | EngineError::YamlError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Info,     // 信息性错误，通常不影响操作
    Warning,  // 警告性错误，跳过本周期即可
    Error,    // 一般错误，需要通知操作员
    Critical, // 严重错误，启动失败
}

pub type Result<T> = std::result::Result<T, EngineError>;
