//! Webhook通知模块
//! 把交易事件推送到 Telegram / 企业微信，全部渠道失败时落盘到 JSON-lines 文件

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::core::error::{EngineError, Result};
use crate::core::risk_manager::{CloseReason, Veto};
use crate::core::types::{ClosedTrade, Position};
use crate::strategies::StrategyKind;

fn default_true() -> bool {
    true
}

fn default_min_level() -> String {
    "info".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_request_timeout_secs() -> u64 {
    3
}

fn default_delivery_budget_ms() -> u64 {
    4_000
}

fn default_fallback_path() -> String {
    "logs/events.jsonl".to_string()
}

/// Telegram 机器人配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

/// 通知配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    /// 企业微信webhook地址
    #[serde(default)]
    pub wechat_work: Option<String>,
    /// 最小推送级别
    #[serde(default = "default_min_level")]
    pub min_level: String,
    /// 每个渠道的最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 单次HTTP请求超时
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 一个事件在全部渠道上的投递时限，超时即落盘；必须小于 engine.notify_timeout_secs
    #[serde(default = "default_delivery_budget_ms")]
    pub delivery_budget_ms: u64,
    /// 同一交易对同类事件的推送间隔限制（秒），0 为不限流
    #[serde(default)]
    pub rate_limit_seconds: u64,
    /// 推送失败时的落盘文件
    #[serde(default = "default_fallback_path")]
    pub fallback_path: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            telegram: None,
            wechat_work: None,
            min_level: default_min_level(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            delivery_budget_ms: default_delivery_budget_ms(),
            rate_limit_seconds: 0,
            fallback_path: default_fallback_path(),
        }
    }
}

impl NotifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(EngineError::config_invalid(
                "notifier.max_attempts",
                "必须大于0",
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(EngineError::config_invalid(
                "notifier.request_timeout_secs",
                "必须大于0",
            ));
        }
        if self.delivery_budget_ms == 0 {
            return Err(EngineError::config_invalid(
                "notifier.delivery_budget_ms",
                "必须大于0",
            ));
        }
        if self.fallback_path.trim().is_empty() {
            return Err(EngineError::config_invalid(
                "notifier.fallback_path",
                "不能为空",
            ));
        }
        if let Some(tg) = &self.telegram {
            if tg.bot_token.is_empty() || tg.chat_id.is_empty() {
                return Err(EngineError::config_invalid(
                    "notifier.telegram",
                    "bot_token 和 chat_id 必须同时提供",
                ));
            }
        }
        Ok(())
    }

    /// 用环境变量 TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID 补全 Telegram 凭证
    pub fn with_env_credentials(mut self) -> Self {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok().filter(|v| !v.is_empty());
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok().filter(|v| !v.is_empty());
        if token.is_none() && chat_id.is_none() {
            return self;
        }

        let mut tg = self.telegram.take().unwrap_or_default();
        if let Some(token) = token {
            tg.bot_token = token;
        }
        if let Some(chat_id) = chat_id {
            tg.chat_id = chat_id;
        }
        self.telegram = Some(tg);
        self
    }
}

/// 消息级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageLevel {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl MessageLevel {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warning" | "warn" => Self::Warning,
            "error" => Self::Error,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }

    pub fn emoji(&self) -> &str {
        match self {
            Self::Debug => "🔍",
            Self::Info => "ℹ️",
            Self::Warning => "⚠️",
            Self::Error => "❌",
            Self::Critical => "🚨",
        }
    }
}

/// 交易事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeEvent {
    EngineStarted {
        symbol: String,
        strategy: StrategyKind,
    },
    EngineStopped {
        symbol: String,
    },
    PositionOpened {
        position: Position,
    },
    /// 加仓成交，position 为加仓后的持仓
    PositionIncreased {
        position: Position,
        added_size: f64,
        fill_price: f64,
    },
    PositionClosed {
        trade: ClosedTrade,
        reason: CloseReason,
        /// 部分平仓后的剩余数量
        remaining_size: f64,
    },
    StopTriggered {
        symbol: String,
        position_id: String,
        price: f64,
        stop_loss: f64,
    },
    TakeProfitTriggered {
        symbol: String,
        position_id: String,
        price: f64,
        take_profit: f64,
    },
    StopAdjusted {
        symbol: String,
        position_id: String,
        old_stop: f64,
        new_stop: f64,
    },
    ActionVetoed {
        veto: Veto,
    },
    ExecutionFailed {
        symbol: String,
        action: String,
        reason: String,
    },
    StrategySwitched {
        symbol: String,
        from: StrategyKind,
        to: StrategyKind,
    },
    /// 定期仓位报告
    StatusReport {
        content: String,
    },
}

impl TradeEvent {
    pub fn symbol(&self) -> &str {
        match self {
            TradeEvent::EngineStarted { symbol, .. }
            | TradeEvent::EngineStopped { symbol }
            | TradeEvent::StopTriggered { symbol, .. }
            | TradeEvent::TakeProfitTriggered { symbol, .. }
            | TradeEvent::StopAdjusted { symbol, .. }
            | TradeEvent::ExecutionFailed { symbol, .. }
            | TradeEvent::StrategySwitched { symbol, .. } => symbol,
            TradeEvent::PositionOpened { position }
            | TradeEvent::PositionIncreased { position, .. } => &position.symbol,
            TradeEvent::PositionClosed { trade, .. } => &trade.symbol,
            TradeEvent::ActionVetoed { veto } => &veto.symbol,
            TradeEvent::StatusReport { .. } => "*",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TradeEvent::EngineStarted { .. } => "engine_started",
            TradeEvent::EngineStopped { .. } => "engine_stopped",
            TradeEvent::PositionOpened { .. } => "position_opened",
            TradeEvent::PositionIncreased { .. } => "position_increased",
            TradeEvent::PositionClosed { .. } => "position_closed",
            TradeEvent::StopTriggered { .. } => "stop_triggered",
            TradeEvent::TakeProfitTriggered { .. } => "take_profit_triggered",
            TradeEvent::StopAdjusted { .. } => "stop_adjusted",
            TradeEvent::ActionVetoed { .. } => "action_vetoed",
            TradeEvent::ExecutionFailed { .. } => "execution_failed",
            TradeEvent::StrategySwitched { .. } => "strategy_switched",
            TradeEvent::StatusReport { .. } => "status_report",
        }
    }

    pub fn level(&self) -> MessageLevel {
        match self {
            TradeEvent::ActionVetoed { .. } | TradeEvent::StopTriggered { .. } => {
                MessageLevel::Warning
            }
            TradeEvent::ExecutionFailed { .. } => MessageLevel::Error,
            _ => MessageLevel::Info,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            TradeEvent::EngineStarted { .. } => "交易引擎启动",
            TradeEvent::EngineStopped { .. } => "交易引擎停止",
            TradeEvent::PositionOpened { .. } => "开仓成功",
            TradeEvent::PositionIncreased { .. } => "加仓成功",
            TradeEvent::PositionClosed { .. } => "平仓成功",
            TradeEvent::StopTriggered { .. } => "触发止损",
            TradeEvent::TakeProfitTriggered { .. } => "触发止盈",
            TradeEvent::StopAdjusted { .. } => "追踪止损上移",
            TradeEvent::ActionVetoed { .. } => "风控否决",
            TradeEvent::ExecutionFailed { .. } => "执行失败",
            TradeEvent::StrategySwitched { .. } => "策略切换",
            TradeEvent::StatusReport { .. } => "仓位报告",
        }
    }
}

impl std::fmt::Display for TradeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TradeEvent::EngineStarted { symbol, strategy } => {
                write!(f, "{} 使用 {} 启动", symbol, strategy.display_name())
            }
            TradeEvent::EngineStopped { symbol } => write!(f, "{} 已停止", symbol),
            TradeEvent::PositionOpened { position } => write!(
                f,
                "{} 开{} {} @ {:.4}，杠杆 {}x，止损 {:.4}，止盈 {:.4}",
                position.symbol,
                if position.side == crate::core::types::Side::Long { "多" } else { "空" },
                position.size,
                position.entry_price,
                position.leverage,
                position.stop_loss,
                position.take_profit
            ),
            TradeEvent::PositionIncreased {
                position,
                added_size,
                fill_price,
            } => write!(
                f,
                "{} 第{}次加仓 {} @ {:.4}，持仓 {} 均价 {:.4}，止损 {:.4}",
                position.symbol,
                position.pyramids,
                added_size,
                fill_price,
                position.size,
                position.entry_price,
                position.stop_loss
            ),
            TradeEvent::PositionClosed {
                trade,
                reason,
                remaining_size,
            } => {
                write!(
                    f,
                    "{} {}平仓 {} @ {:.4}，开仓价 {:.4}，盈亏 {:+.4}（保证金收益 {:+.2}%）",
                    trade.symbol,
                    reason,
                    trade.size,
                    trade.exit_price,
                    trade.entry_price,
                    trade.realized_pnl,
                    trade.return_on_margin_pct
                )?;
                if *remaining_size > 0.0 {
                    write!(f, "，剩余 {}", remaining_size)?;
                }
                Ok(())
            }
            TradeEvent::StopTriggered {
                symbol,
                price,
                stop_loss,
                ..
            } => write!(f, "{} 价格 {:.4} 触及止损 {:.4}", symbol, price, stop_loss),
            TradeEvent::TakeProfitTriggered {
                symbol,
                price,
                take_profit,
                ..
            } => write!(f, "{} 价格 {:.4} 触及止盈 {:.4}", symbol, price, take_profit),
            TradeEvent::StopAdjusted {
                symbol,
                old_stop,
                new_stop,
                ..
            } => write!(f, "{} 止损 {:.4} → {:.4}", symbol, old_stop, new_stop),
            TradeEvent::ActionVetoed { veto } => write!(f, "{}", veto),
            TradeEvent::ExecutionFailed {
                symbol,
                action,
                reason,
            } => write!(f, "{} {} 重试后仍失败: {}", symbol, action, reason),
            TradeEvent::StrategySwitched { symbol, from, to } => write!(
                f,
                "{} 策略 {} → {}",
                symbol,
                from.display_name(),
                to.display_name()
            ),
            TradeEvent::StatusReport { content } => write!(f, "{}", content),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("通知渠道全部失败: {0}")]
    AllChannelsFailed(String),

    #[error("落盘失败: {0}")]
    Fallback(#[from] std::io::Error),
}

/// 事件通知接口，投递尽力而为，不影响交易状态
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TradeEvent) -> std::result::Result<(), NotifyError>;
}

/// 单个推送渠道
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send_text(&self, title: &str, body: &str, level: MessageLevel) -> anyhow::Result<()>;
}

/// 带请求超时的HTTP客户端
fn http_client(timeout_secs: u64) -> Client {
    Client::builder()
        .user_agent("swapbot/0.1.0")
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|e| {
            warn!("⚠️ 创建HTTP客户端失败，改用默认客户端: {}", e);
            Client::new()
        })
}

pub struct TelegramChannel {
    client: Client,
    cfg: TelegramConfig,
}

impl TelegramChannel {
    pub fn new(cfg: TelegramConfig, timeout_secs: u64) -> Self {
        Self {
            client: http_client(timeout_secs),
            cfg,
        }
    }
}

#[async_trait]
impl NotificationChannel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_text(&self, title: &str, body: &str, level: MessageLevel) -> anyhow::Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.cfg.bot_token);
        let payload = json!({
            "chat_id": self.cfg.chat_id,
            "text": format!("{} {}\n{}", level.emoji(), title, body),
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("Telegram 请求失败: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Telegram 返回异常: {status} - {text}"));
        }
        Ok(())
    }
}

pub struct WeComChannel {
    client: Client,
    webhook_url: String,
}

impl WeComChannel {
    pub fn new(webhook_url: String, timeout_secs: u64) -> Self {
        Self {
            client: http_client(timeout_secs),
            webhook_url,
        }
    }
}

#[async_trait]
impl NotificationChannel for WeComChannel {
    fn name(&self) -> &str {
        "wechat_work"
    }

    async fn send_text(&self, title: &str, body: &str, level: MessageLevel) -> anyhow::Result<()> {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        let content = format!(
            "## {} {}\n\n**级别**: {:?}\n**时间**: {}\n\n{}",
            level.emoji(),
            title,
            level,
            now,
            body
        );
        let payload = json!({
            "msgtype": "markdown",
            "markdown": { "content": content },
        });

        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("WeCom webhook 请求失败: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("WeCom webhook 返回异常: {status} - {text}"));
        }
        Ok(())
    }
}

/// 落盘记录
#[derive(Debug, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub recorded_at: DateTime<Utc>,
    pub error: String,
    pub event: TradeEvent,
}

/// Webhook通知器
pub struct WebhookNotifier {
    config: NotifierConfig,
    channels: Vec<Arc<dyn NotificationChannel>>,
    /// 上次发送时间记录（用于限流）
    last_send_times: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl WebhookNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
        if let Some(tg) = config.telegram.clone() {
            channels.push(Arc::new(TelegramChannel::new(tg, config.request_timeout_secs)));
        }
        if let Some(url) = config.wechat_work.clone().filter(|u| !u.is_empty()) {
            channels.push(Arc::new(WeComChannel::new(url, config.request_timeout_secs)));
        }
        Self::with_channels(config, channels)
    }

    pub fn with_channels(config: NotifierConfig, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        if channels.is_empty() {
            info!("📭 未配置推送渠道，事件只写日志");
        }
        Self {
            config,
            channels,
            last_send_times: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// 检查限流
    async fn check_rate_limit(&self, key: &str) -> bool {
        if self.config.rate_limit_seconds == 0 {
            return true;
        }
        let mut times = self.last_send_times.write().await;
        let now = Utc::now();

        if let Some(last_time) = times.get(key) {
            let elapsed = now.signed_duration_since(*last_time);
            if elapsed < Duration::seconds(self.config.rate_limit_seconds as i64) {
                return false;
            }
        }

        times.insert(key.to_string(), now);
        true
    }

    /// 单个渠道按次数上限尝试发送
    async fn send_with_attempts(
        &self,
        channel: &dyn NotificationChannel,
        title: &str,
        body: &str,
        level: MessageLevel,
    ) -> anyhow::Result<()> {
        let mut last_err = anyhow!("未发送");
        for attempt in 1..=self.config.max_attempts {
            match channel.send_text(title, body, level).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("{} 第{}次推送失败: {}", channel.name(), attempt, e);
                    last_err = e;
                }
            }
            if attempt < self.config.max_attempts {
                let base = self.config.retry_delay_ms * attempt as u64;
                let jitter = rand::thread_rng().gen_range(0..=base / 4);
                tokio::time::sleep(std::time::Duration::from_millis(base + jitter)).await;
            }
        }
        Err(last_err.context(format!("{} 尝试 {} 次后放弃", channel.name(), self.config.max_attempts)))
    }

    async fn write_fallback(&self, event: &TradeEvent, error: &str) -> std::io::Result<()> {
        let record = FallbackRecord {
            recorded_at: Utc::now(),
            error: error.to_string(),
            event: event.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let path = std::path::Path::new(&self.config.fallback_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TradeEvent) -> std::result::Result<(), NotifyError> {
        let level = event.level();
        info!("{} [{}] {}", level.emoji(), event.title(), event);

        if !self.config.enabled || self.channels.is_empty() {
            return Ok(());
        }
        if level < MessageLevel::from_str(&self.config.min_level) {
            return Ok(());
        }
        let key = format!("{}::{}", event.symbol(), event.kind());
        if !self.check_rate_limit(&key).await {
            debug!("跳过推送，限流中: {}", key);
            return Ok(());
        }

        let title = event.title();
        let body = event.to_string();
        let mut failures = Vec::new();
        let budget = std::time::Duration::from_millis(self.config.delivery_budget_ms);
        let delivery = async {
            for channel in &self.channels {
                if let Err(e) = self
                    .send_with_attempts(channel.as_ref(), title, &body, level)
                    .await
                {
                    warn!("⚠️ 通知发送失败: {:#}", e);
                    failures.push(format!("{:#}", e));
                }
            }
        };
        // 超出时限的渠道视为失败，事件仍然落盘
        if tokio::time::timeout(budget, delivery).await.is_err() {
            warn!(
                "⚠️ {} 通知超出投递时限 {}ms，改为落盘",
                event.kind(),
                self.config.delivery_budget_ms
            );
            failures.push(format!("超出投递时限 {}ms", self.config.delivery_budget_ms));
        }

        if failures.is_empty() {
            return Ok(());
        }
        let reason = failures.join("; ");
        if let Err(e) = self.write_fallback(event, &reason).await {
            error!("❌ 通知落盘失败 {}: {}", self.config.fallback_path, e);
            return Err(NotifyError::Fallback(e));
        }
        Err(NotifyError::AllChannelsFailed(reason))
    }
}
