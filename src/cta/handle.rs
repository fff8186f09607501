//! 操作员命令接口
//!
//! 策略切换与参数设置进入命令队列，由引擎在空闲时应用；
//! 状态查询读取引擎发布的快照，余额查询直接走执行网关（只读）。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::core::error::{EngineError, Result};
use crate::core::exchange::ExecutionGateway;
use crate::core::types::{Balance, Position, Signal};
use crate::cta::decision::EngineState;
use crate::strategies::{StrategyKind, StrategySettings};

/// 排队等待引擎空闲时应用的命令
#[derive(Debug)]
pub enum EngineCommand {
    SwitchStrategy {
        kind: StrategyKind,
        reply: oneshot::Sender<Result<()>>,
    },
    SetParam {
        key: String,
        value: f64,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// 引擎状态快照
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub symbol: String,
    pub state: EngineState,
    pub strategy: StrategySettings,
    pub position: Option<Position>,
    pub last_price: Option<f64>,
    pub last_signal: Option<Signal>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EngineStatus {
    pub fn new(symbol: &str, strategy: StrategySettings) -> Self {
        Self {
            symbol: symbol.to_string(),
            state: EngineState::Idle,
            strategy,
            position: None,
            last_price: None,
            last_signal: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

pub type SharedStatus = Arc<RwLock<EngineStatus>>;

#[derive(Clone)]
pub struct EngineHandle {
    symbol: String,
    commands: mpsc::Sender<EngineCommand>,
    status: SharedStatus,
    gateway: Arc<dyn ExecutionGateway>,
    timeout: Duration,
}

impl EngineHandle {
    pub fn new(
        symbol: &str,
        commands: mpsc::Sender<EngineCommand>,
        status: SharedStatus,
        gateway: Arc<dyn ExecutionGateway>,
        timeout: Duration,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            commands,
            status,
            gateway,
            timeout,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// 切换策略，等引擎空闲应用后返回
    pub async fn switch_strategy(&self, kind: StrategyKind) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::SwitchStrategy { kind, reply })
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    /// 设置策略参数，等引擎空闲应用后返回
    pub async fn set_param(&self, key: &str, value: f64) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::SetParam {
                key: key.to_string(),
                value,
                reply,
            })
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }

    pub async fn balance(&self) -> Result<Balance> {
        tokio::time::timeout(self.timeout, self.gateway.query_balance())
            .await
            .map_err(|_| EngineError::ExecutionFailure("查询余额超时".to_string()))?
    }
}
