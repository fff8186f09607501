//! 交易引擎
//!
//! 每个交易对一个评估循环，周期严格串行：
//! 行情 → 指标 → 策略信号 → 决策 → 风控审核 → 执行 → 持仓簿 → 通知。

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::core::config::EngineSettings;
use crate::core::error::EngineError;
use crate::core::exchange::{ExecutionGateway, MarketDataProvider};
use crate::core::risk_manager::{
    ApprovedAction, CloseReason, IntendedAction, RiskManager, Veto, VetoReason,
};
use crate::core::types::{MarketSnapshot, OrderResult, Position, Side, Signal};
use crate::cta::decision::{decide, EngineState};
use crate::cta::handle::{EngineCommand, EngineHandle, EngineStatus, SharedStatus};
use crate::cta::position_book::PositionBook;
use crate::strategies::StrategySettings;
use crate::utils::indicators::{IndicatorConfig, IndicatorEngine, IndicatorReading, IndicatorSet};
use crate::utils::webhook::{Notifier, TradeEvent};

const COMMAND_QUEUE: usize = 32;

/// 引擎运行所需的共享依赖，显式构造后传入
#[derive(Clone)]
pub struct EngineContext {
    pub risk: Arc<RiskManager>,
    pub book: PositionBook,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub settings: EngineSettings,
    pub indicators: IndicatorConfig,
}

/// 提交给执行网关的调用
#[derive(Debug, Clone)]
enum GatewayCall {
    Open {
        side: Side,
        size: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
    },
    Increase {
        position_id: String,
        size: f64,
    },
    Close {
        position_id: String,
    },
}

impl GatewayCall {
    fn describe(&self) -> String {
        match self {
            GatewayCall::Open { side, size, .. } => format!("开{}仓 {}", side, size),
            GatewayCall::Increase { position_id, size } => {
                format!("加仓 {} {}", position_id, size)
            }
            GatewayCall::Close { position_id } => format!("平仓 {}", position_id),
        }
    }
}

/// 等待停止信号，发送端关闭也视为停止
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub struct TradingEngine {
    symbol: String,
    ctx: EngineContext,
    strategy: StrategySettings,
    indicators: IndicatorEngine,
    state: EngineState,
    status: SharedStatus,
    commands: mpsc::Receiver<EngineCommand>,
    shutdown: watch::Receiver<bool>,
    last_price: Option<f64>,
    last_signal: Option<Signal>,
    last_error: Option<String>,
    /// 当前周期的行情时间
    cycle_time: DateTime<Utc>,
    sequence: u64,
}

impl TradingEngine {
    pub fn new(
        symbol: &str,
        ctx: EngineContext,
        strategy: StrategySettings,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let status: SharedStatus = Arc::new(RwLock::new(EngineStatus::new(symbol, strategy.clone())));
        let handle = EngineHandle::new(
            symbol,
            tx,
            status.clone(),
            ctx.gateway.clone(),
            Duration::from_secs(ctx.settings.execution_timeout_secs),
        );
        let engine = Self {
            symbol: symbol.to_string(),
            indicators: IndicatorEngine::new(symbol, ctx.indicators.clone()),
            ctx,
            strategy,
            state: EngineState::Idle,
            status,
            commands: rx,
            shutdown,
            last_price: None,
            last_signal: None,
            last_error: None,
            cycle_time: Utc::now(),
            sequence: 0,
        };
        (engine, handle)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn strategy(&self) -> &StrategySettings {
        &self.strategy
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// 主循环，行情通道关闭或收到停止信号时退出
    pub async fn run(mut self, mut snapshots: mpsc::Receiver<MarketSnapshot>) {
        info!(
            "🚀 {} 交易引擎启动，策略: {}，预热需要 {} 个样本",
            self.symbol,
            self.strategy.active.display_name(),
            self.indicators.min_samples()
        );
        self.notify(TradeEvent::EngineStarted {
            symbol: self.symbol.clone(),
            strategy: self.strategy.active,
        })
        .await;
        self.publish().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    info!("🛑 {} 收到停止信号", self.symbol);
                    break;
                }
                Some(command) = self.commands.recv() => {
                    self.apply_command(command).await;
                }
                snapshot = snapshots.recv() => match snapshot {
                    Some(first) => {
                        let mut batch = vec![first];
                        while let Ok(next) = snapshots.try_recv() {
                            batch.push(next);
                        }
                        self.process_batch(batch).await;
                    }
                    None => {
                        info!("📭 {} 行情通道已关闭", self.symbol);
                        break;
                    }
                },
            }
        }

        self.notify(TradeEvent::EngineStopped {
            symbol: self.symbol.clone(),
        })
        .await;
        info!("👋 {} 交易引擎已停止", self.symbol);
    }

    /// 处理一批行情：全部喂给指标引擎，只评估最新的一条
    pub async fn process_batch(&mut self, batch: Vec<MarketSnapshot>) {
        if batch.len() > 1 {
            debug!("{} 合并 {} 条缓冲行情", self.symbol, batch.len());
        }

        let mut latest = None;
        for snapshot in &batch {
            match self.indicators.update(snapshot) {
                IndicatorReading::Dropped(_) => {}
                reading => latest = Some((snapshot.last_price, reading)),
            }
        }
        let Some((price, reading)) = latest else {
            return;
        };
        self.last_price = Some(price);

        // 先应用排队的命令
        while let Ok(command) = self.commands.try_recv() {
            self.apply_command(command).await;
        }

        match reading {
            IndicatorReading::Ready(set) => self.run_cycle(set).await,
            IndicatorReading::InsufficientData { have, need } => {
                debug!(
                    "{} {}",
                    self.symbol,
                    EngineError::InsufficientData { have, need }
                );
                self.publish().await;
            }
            IndicatorReading::Dropped(_) => {}
        }
    }

    async fn run_cycle(&mut self, set: IndicatorSet) {
        self.cycle_time = set.timestamp;
        self.set_state(EngineState::Evaluating).await;

        let position = self.ctx.book.get(&self.symbol).await;
        let signal = self.strategy.evaluate(&set, position.as_ref());
        let action = decide(
            &self.ctx.risk,
            &self.ctx.settings,
            &signal,
            &set,
            position.as_ref(),
            set.timestamp,
        );
        debug!(
            "{} 价格 {:.4} 信号 {:?}({:.2}) {} → {:?}",
            self.symbol, set.price, signal.direction, signal.confidence, signal.reason, action
        );
        self.last_signal = Some(signal);

        if action != IntendedAction::Hold {
            self.handle_action(action, position.as_ref(), &set).await;
        }

        self.ctx.book.observe_price(&self.symbol, set.price).await;
        self.set_state(EngineState::Idle).await;
    }

    async fn handle_action(
        &mut self,
        action: IntendedAction,
        position: Option<&Position>,
        set: &IndicatorSet,
    ) {
        let open_count = self.ctx.book.open_count().await;
        let approved = match self
            .ctx
            .risk
            .review(&self.symbol, &action, position, open_count, set.price)
        {
            Ok(approved) => approved,
            Err(veto) => {
                self.veto(veto).await;
                return;
            }
        };

        match approved {
            ApprovedAction::Hold => {}
            ApprovedAction::AdjustStop {
                position_id,
                new_stop_loss,
                trigger_price,
            } => {
                let old_stop = position.map(|p| p.stop_loss).unwrap_or_default();
                if self
                    .ctx
                    .book
                    .adjust_stop(&self.symbol, new_stop_loss, trigger_price)
                    .await
                {
                    info!(
                        "📈 {} 追踪止损 {:.4} → {:.4} (价格 {:.4})",
                        self.symbol, old_stop, new_stop_loss, trigger_price
                    );
                    self.notify(TradeEvent::StopAdjusted {
                        symbol: self.symbol.clone(),
                        position_id,
                        old_stop,
                        new_stop: new_stop_loss,
                    })
                    .await;
                }
            }
            ApprovedAction::AddToPosition {
                position_id,
                side,
                size,
            } => {
                info!(
                    "➕ {} 满足加仓条件，{}仓加 {} @ {:.4}",
                    self.symbol, side, size, set.price
                );
                self.execute_add(position_id, size).await;
            }
            ApprovedAction::Open {
                side,
                size,
                leverage,
                stop_loss,
                take_profit,
                ..
            } => {
                self.execute_open(GatewayCall::Open {
                    side,
                    size,
                    leverage,
                    stop_loss,
                    take_profit,
                })
                .await;
            }
            ApprovedAction::Close {
                position_id,
                reason,
                reverse_to,
            } => {
                let Some(pos) = position else {
                    return;
                };
                match reason {
                    CloseReason::StopLoss => {
                        warn!(
                            "🛑 {} 价格 {:.4} 触发止损 {:.4}",
                            self.symbol, set.price, pos.stop_loss
                        );
                        self.notify(TradeEvent::StopTriggered {
                            symbol: self.symbol.clone(),
                            position_id: position_id.clone(),
                            price: set.price,
                            stop_loss: pos.stop_loss,
                        })
                        .await;
                    }
                    CloseReason::TakeProfit => {
                        info!(
                            "🎯 {} 价格 {:.4} 触发止盈 {:.4}",
                            self.symbol, set.price, pos.take_profit
                        );
                        self.notify(TradeEvent::TakeProfitTriggered {
                            symbol: self.symbol.clone(),
                            position_id: position_id.clone(),
                            price: set.price,
                            take_profit: pos.take_profit,
                        })
                        .await;
                    }
                    CloseReason::AnchoredStop | CloseReason::VolatilityStop => {
                        warn!(
                            "🛑 {} 价格 {:.4} 触发{}，ATR {:.4}，ADX {:.2}",
                            self.symbol, set.price, reason, set.atr, set.adx
                        );
                    }
                    CloseReason::TimeStop | CloseReason::Signal => {
                        info!("🔄 {} {}平仓", self.symbol, reason);
                    }
                }

                let fully_closed = self.execute_close(position_id, reason).await;
                if let (true, Some(side)) = (fully_closed, reverse_to) {
                    self.open_reversal(side, set).await;
                }
            }
        }
    }

    /// 反手：平仓确认后重新走一遍风控审核再开仓
    async fn open_reversal(&mut self, side: Side, set: &IndicatorSet) {
        let action = IntendedAction::Open {
            side,
            size: self.ctx.risk.position_size(set.volatility_pct),
            leverage: self.ctx.risk.config().leverage,
        };
        let open_count = self.ctx.book.open_count().await;
        match self
            .ctx
            .risk
            .review(&self.symbol, &action, None, open_count, set.price)
        {
            Ok(ApprovedAction::Open {
                side,
                size,
                leverage,
                stop_loss,
                take_profit,
                ..
            }) => {
                info!("🔁 {} 反手开{}仓", self.symbol, side);
                self.execute_open(GatewayCall::Open {
                    side,
                    size,
                    leverage,
                    stop_loss,
                    take_profit,
                })
                .await;
            }
            Ok(_) => {}
            Err(veto) => self.veto(veto).await,
        }
    }

    async fn execute_open(&mut self, call: GatewayCall) {
        let (side, leverage) = match &call {
            GatewayCall::Open { side, leverage, .. } => (*side, *leverage),
            GatewayCall::Increase { .. } | GatewayCall::Close { .. } => return,
        };
        let max_positions = self.ctx.risk.config().max_positions;
        if !self.ctx.book.reserve_open(&self.symbol, max_positions).await {
            // 其他交易对在审核后抢先占用了名额
            let reason = match self.ctx.book.get(&self.symbol).await {
                Some(_) => VetoReason::PositionAlreadyOpen,
                None => VetoReason::MaxPositionsReached {
                    open: self.ctx.book.open_count().await,
                    max: max_positions,
                },
            };
            self.veto(Veto {
                symbol: self.symbol.clone(),
                reason,
            })
            .await;
            return;
        }

        let Some((fill_price, filled_size)) = self.execute_with_retry(&call).await else {
            self.ctx.book.release(&self.symbol).await;
            return;
        };

        self.sequence += 1;
        let id = format!(
            "{}-{}-{}",
            self.symbol,
            self.cycle_time.timestamp_millis(),
            self.sequence
        );
        let position = self.ctx.risk.build_position(
            id,
            &self.symbol,
            side,
            leverage,
            fill_price,
            filled_size,
            self.cycle_time,
        );
        if self.ctx.book.confirm_open(position.clone()).await {
            info!(
                "✅ {} 开{}仓成交 {} @ {:.4}，止损 {:.4}，止盈 {:.4}",
                self.symbol,
                side,
                filled_size,
                fill_price,
                position.stop_loss,
                position.take_profit
            );
            self.notify(TradeEvent::PositionOpened { position }).await;
        }
    }

    /// 加仓成交后按数量加权更新开仓价
    async fn execute_add(&mut self, position_id: String, size: f64) {
        let call = GatewayCall::Increase { position_id, size };
        let Some((fill_price, filled_size)) = self.execute_with_retry(&call).await else {
            return;
        };

        match self
            .ctx
            .book
            .apply_add(&self.symbol, fill_price, filled_size)
            .await
        {
            Some(position) => {
                info!(
                    "✅ {} 第 {} 次加仓成交 {} @ {:.4}，持仓 {} 均价 {:.4}",
                    self.symbol,
                    position.pyramids,
                    filled_size,
                    fill_price,
                    position.size,
                    position.entry_price
                );
                self.notify(TradeEvent::PositionIncreased {
                    position,
                    added_size: filled_size,
                    fill_price,
                })
                .await;
            }
            None => warn!("⚠️ {} 加仓成交但持仓簿中已无持仓", self.symbol),
        }
    }

    /// 返回是否已全部平仓
    async fn execute_close(&mut self, position_id: String, reason: CloseReason) -> bool {
        let call = GatewayCall::Close { position_id };
        let Some((fill_price, filled_size)) = self.execute_with_retry(&call).await else {
            return false;
        };

        let Some((before, after)) = self.ctx.book.apply_close(&self.symbol, filled_size).await
        else {
            warn!("⚠️ {} 平仓成交但持仓簿中已无持仓", self.symbol);
            return true;
        };
        let trade = self
            .ctx
            .risk
            .settle_close(&before, fill_price, filled_size, self.cycle_time);
        info!(
            "💰 {} {}平仓成交 {} @ {:.4}，已实现盈亏 {:+.4} ({:+.2}%)",
            self.symbol,
            reason,
            trade.size,
            fill_price,
            trade.realized_pnl,
            trade.return_on_margin_pct
        );
        let remaining_size = after.as_ref().map(|p| p.size).unwrap_or(0.0);
        self.notify(TradeEvent::PositionClosed {
            trade,
            reason,
            remaining_size,
        })
        .await;
        after.is_none()
    }

    /// 提交并在失败后冷却重试一次；成功返回 (成交价, 成交数量)
    async fn execute_with_retry(&mut self, call: &GatewayCall) -> Option<(f64, f64)> {
        self.set_state(EngineState::AwaitingExecution).await;
        let first = self.submit(call).await;
        let reason = match Self::confirmed_fill(&first) {
            Ok(fill) => return Some(fill),
            Err(reason) => reason,
        };

        let cooldown = self.ctx.settings.cooldown_secs;
        warn!(
            "⚠️ {} {} 失败: {}，{}秒后重试",
            self.symbol,
            call.describe(),
            reason,
            cooldown
        );
        self.last_error = Some(reason);
        self.set_state(EngineState::Cooldown).await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(cooldown)) => {}
            _ = shutdown_requested(&mut self.shutdown) => {
                info!("🛑 {} 停止中，放弃待重试的 {}", self.symbol, call.describe());
                return None;
            }
        }

        self.set_state(EngineState::AwaitingExecution).await;
        let second = self.submit(call).await;
        match Self::confirmed_fill(&second) {
            Ok(fill) => Some(fill),
            Err(reason) => {
                error!(
                    "❌ {} {} 重试失败: {}",
                    self.symbol,
                    call.describe(),
                    reason
                );
                self.last_error = Some(reason.clone());
                self.notify(TradeEvent::ExecutionFailed {
                    symbol: self.symbol.clone(),
                    action: call.describe(),
                    reason,
                })
                .await;
                None
            }
        }
    }

    fn confirmed_fill(result: &OrderResult) -> std::result::Result<(f64, f64), String> {
        match result {
            OrderResult::Confirmed {
                fill_price,
                filled_size,
            } => {
                if fill_price.is_finite() && *fill_price > 0.0 && filled_size.is_finite() && *filled_size > 0.0 {
                    Ok((*fill_price, *filled_size))
                } else {
                    Err(format!(
                        "成交回报无效: 价格 {}, 数量 {}",
                        fill_price, filled_size
                    ))
                }
            }
            other => Err(other
                .failure_reason()
                .unwrap_or_else(|| "未知错误".to_string())),
        }
    }

    /// 单次网关调用，超时视为 Timeout
    async fn submit(&self, call: &GatewayCall) -> OrderResult {
        let timeout = Duration::from_secs(self.ctx.settings.execution_timeout_secs);
        let gateway = &self.ctx.gateway;
        let fut = async {
            match call {
                GatewayCall::Open {
                    side,
                    size,
                    leverage,
                    stop_loss,
                    take_profit,
                } => {
                    gateway
                        .submit_open(&self.symbol, *side, *size, *leverage, *stop_loss, *take_profit)
                        .await
                }
                GatewayCall::Increase { position_id, size } => {
                    gateway.submit_increase(position_id, *size).await
                }
                GatewayCall::Close { position_id } => gateway.submit_close(position_id).await,
            }
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "⏱️ {} {} 超过 {} 秒未返回",
                    self.symbol,
                    call.describe(),
                    timeout.as_secs()
                );
                OrderResult::Timeout
            }
        }
    }

    async fn apply_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SwitchStrategy { kind, reply } => {
                let from = self.strategy.active;
                self.strategy.active = kind;
                if from != kind {
                    info!(
                        "🔀 {} 策略切换 {} → {}",
                        self.symbol,
                        from.display_name(),
                        kind.display_name()
                    );
                    self.notify(TradeEvent::StrategySwitched {
                        symbol: self.symbol.clone(),
                        from,
                        to: kind,
                    })
                    .await;
                }
                let _ = reply.send(Ok(()));
            }
            EngineCommand::SetParam { key, value, reply } => {
                let result = self.strategy.set_param(&key, value);
                match &result {
                    Ok(()) => info!("⚙️ {} 参数 {} = {}", self.symbol, key, value),
                    Err(e) => warn!("⚠️ {} 参数设置失败: {}", self.symbol, e),
                }
                let _ = reply.send(result);
            }
        }
        self.publish().await;
    }

    async fn veto(&mut self, veto: Veto) {
        self.last_error = Some(EngineError::RiskVeto(veto.clone()).to_string());
        self.notify(TradeEvent::ActionVetoed { veto }).await;
    }

    /// 通知有超时上限，失败只记日志
    async fn notify(&self, event: TradeEvent) {
        let timeout = Duration::from_secs(self.ctx.settings.notify_timeout_secs);
        match tokio::time::timeout(timeout, self.ctx.notifier.notify(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("⚠️ {} 事件通知失败: {}", self.symbol, e),
            Err(_) => warn!("⚠️ {} 事件通知超时，已丢弃: {}", self.symbol, event.kind()),
        }
    }

    async fn set_state(&mut self, state: EngineState) {
        self.state = state;
        self.publish().await;
    }

    async fn publish(&self) {
        let position = self.ctx.book.get(&self.symbol).await;
        let mut status = self.status.write().await;
        status.state = self.state;
        status.strategy = self.strategy.clone();
        status.position = position;
        status.last_price = self.last_price;
        status.last_signal = self.last_signal.clone();
        status.last_error = self.last_error.clone();
        status.updated_at = Utc::now();
    }
}

/// 行情拉取任务，按固定间隔轮询并推入有界通道
pub fn spawn_feed(
    provider: Arc<dyn MarketDataProvider>,
    symbol: String,
    interval: Duration,
    tx: mpsc::Sender<MarketSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {
                    match provider.poll(&symbol).await {
                        Ok(snapshot) => {
                            consecutive_errors = 0;
                            if tx.send(snapshot).await.is_err() {
                                break;
                            }
                        }
                        Err(EngineError::FeedExhausted(_)) => {
                            info!("📭 {} {} 行情数据已全部回放", provider.name(), symbol);
                            break;
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            warn!(
                                "⚠️ {} 拉取行情失败 (连续 {} 次): {}",
                                symbol, consecutive_errors, e
                            );
                        }
                    }
                }
            }
        }
        debug!("{} 行情任务退出", symbol);
    })
}
