//! 交易引擎端到端场景：脚本化执行网关 + 记录型通知器

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use swapbot::core::config::EngineSettings;
use swapbot::core::error::{EngineError, Result};
use swapbot::core::exchange::ExecutionGateway;
use swapbot::core::risk_manager::{
    AtrStopConfig, CloseReason, PyramidConfig, RiskConfig, RiskManager, SizingMode, VetoReason,
};
use swapbot::core::types::{Balance, MarketSnapshot, OrderResult, Position, Side};
use swapbot::cta::{EngineContext, EngineState, PositionBook, TradingEngine};
use swapbot::strategies::{StrategyKind, StrategySettings};
use swapbot::utils::indicators::IndicatorConfig;
use swapbot::utils::webhook::{
    FallbackRecord, MessageLevel, NotificationChannel, Notifier, NotifierConfig, NotifyError,
    TradeEvent, WebhookNotifier,
};

const BTC: &str = "BTC-USDT-SWAP";
const ETH: &str = "ETH-USDT-SWAP";

enum Step {
    Respond(OrderResult),
    /// 永不返回，由引擎的执行超时兜底
    Hang,
}

struct ScriptedGateway {
    book: PositionBook,
    fill_price: Mutex<f64>,
    open_script: Mutex<VecDeque<Step>>,
    close_script: Mutex<VecDeque<Step>>,
    opens: AtomicUsize,
    increases: AtomicUsize,
    closes: AtomicUsize,
}

impl ScriptedGateway {
    fn new(book: PositionBook, fill_price: f64) -> Self {
        Self {
            book,
            fill_price: Mutex::new(fill_price),
            open_script: Mutex::new(VecDeque::new()),
            close_script: Mutex::new(VecDeque::new()),
            opens: AtomicUsize::new(0),
            increases: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }

    fn set_fill_price(&self, price: f64) {
        *self.fill_price.lock().unwrap() = price;
    }

    fn script_close(&self, step: Step) {
        self.close_script.lock().unwrap().push_back(step);
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn increases(&self) -> usize {
        self.increases.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    async fn play(step: Option<Step>, default: OrderResult) -> OrderResult {
        match step {
            Some(Step::Respond(result)) => result,
            Some(Step::Hang) => {
                std::future::pending::<()>().await;
                OrderResult::Timeout
            }
            None => default,
        }
    }
}

#[async_trait]
impl ExecutionGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit_open(
        &self,
        _symbol: &str,
        _side: Side,
        size: f64,
        _leverage: u32,
        _stop_loss: f64,
        _take_profit: f64,
    ) -> OrderResult {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let step = self.open_script.lock().unwrap().pop_front();
        let fill_price = *self.fill_price.lock().unwrap();
        Self::play(
            step,
            OrderResult::Confirmed {
                fill_price,
                filled_size: size,
            },
        )
        .await
    }

    async fn submit_increase(&self, _position_id: &str, size: f64) -> OrderResult {
        self.increases.fetch_add(1, Ordering::SeqCst);
        OrderResult::Confirmed {
            fill_price: *self.fill_price.lock().unwrap(),
            filled_size: size,
        }
    }

    async fn submit_close(&self, position_id: &str) -> OrderResult {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let step = self.close_script.lock().unwrap().pop_front();
        let fill_price = *self.fill_price.lock().unwrap();
        let default = match self.book.find_by_id(position_id).await {
            Some(pos) => OrderResult::Confirmed {
                fill_price,
                filled_size: pos.size,
            },
            None => OrderResult::Rejected(format!("未知持仓 {}", position_id)),
        };
        Self::play(step, default).await
    }

    async fn query_balance(&self) -> Result<Balance> {
        Ok(Balance {
            currency: "USDT".to_string(),
            total: 1_000.0,
            available: 1_000.0,
        })
    }
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<TradeEvent>>,
}

impl RecordingNotifier {
    fn events(&self) -> Vec<TradeEvent> {
        self.events.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &TradeEvent) -> std::result::Result<(), NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// 记录事件后永不返回，模拟卡死的通知器
#[derive(Default)]
struct StalledNotifier {
    inner: RecordingNotifier,
}

#[async_trait]
impl Notifier for StalledNotifier {
    async fn notify(&self, event: &TradeEvent) -> std::result::Result<(), NotifyError> {
        self.inner.notify(event).await?;
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// 永不响应的推送渠道
struct StalledChannel;

#[async_trait]
impl NotificationChannel for StalledChannel {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn send_text(&self, _: &str, _: &str, _: MessageLevel) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn risk_config(stop_loss_pct: f64, take_profit_pct: f64, max_positions: usize) -> RiskConfig {
    RiskConfig {
        leverage: 10,
        max_leverage: 20,
        position_size: 0.01,
        max_positions,
        max_exposure: 1.0,
        stop_loss_pct,
        take_profit_pct,
        trailing_threshold_pct: 1.0,
        sizing: SizingMode::Fixed,
        max_holding_hours: None,
        time_stop_min_profit_pct: 1.0,
        pyramid: PyramidConfig::default(),
        atr_stops: AtrStopConfig::default(),
    }
}

/// 5 个样本即可产出完整指标集
fn small_indicators() -> IndicatorConfig {
    IndicatorConfig {
        ma_fast: 2,
        ma_slow: 4,
        rsi_period: 3,
        volatility_window: 3,
        atr_period: 3,
        bollinger_period: 4,
        bollinger_std_dev: 2.0,
        breakout_window: 4,
        adx_period: 2,
        anchor_window: 3,
        extreme_window: 3,
    }
}

fn trend_strategy(threshold_pct: f64) -> StrategySettings {
    let mut settings = StrategySettings::new(StrategyKind::TrendFollowing);
    settings.params.trend_following.threshold_pct = threshold_pct;
    settings
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn snapshots(symbol: &str, start: usize, prices: &[f64]) -> Vec<MarketSnapshot> {
    prices
        .iter()
        .enumerate()
        .map(|(i, p)| {
            MarketSnapshot::from_price(symbol, t0() + ChronoDuration::minutes((start + i) as i64), *p)
        })
        .collect()
}

struct Harness {
    book: PositionBook,
    gateway: Arc<ScriptedGateway>,
    notifier: Arc<RecordingNotifier>,
    risk: Arc<RiskManager>,
    ctx: EngineContext,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Harness {
    fn new(risk: RiskConfig, fill_price: f64) -> Self {
        let book = PositionBook::new();
        let gateway = Arc::new(ScriptedGateway::new(book.clone(), fill_price));
        let notifier = Arc::new(RecordingNotifier::default());
        let risk = Arc::new(RiskManager::new(risk));
        let ctx = EngineContext {
            risk: risk.clone(),
            book: book.clone(),
            gateway: gateway.clone(),
            notifier: notifier.clone(),
            settings: EngineSettings {
                cooldown_secs: 30,
                execution_timeout_secs: 30,
                ..EngineSettings::default()
            },
            indicators: small_indicators(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            book,
            gateway,
            notifier,
            risk,
            ctx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    fn engine(&self, symbol: &str, strategy: StrategySettings) -> TradingEngine {
        let (engine, _handle) =
            TradingEngine::new(symbol, self.ctx.clone(), strategy, self.shutdown_rx.clone());
        engine
    }

    async fn seed_long(&self, symbol: &str, entry: f64) -> Position {
        let pos = self
            .risk
            .build_position(format!("{}-seed", symbol), symbol, Side::Long, 10, entry, 0.01, t0());
        assert!(self.book.restore(pos.clone()).await);
        pos
    }
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test]
async fn test_stop_loss_closes_before_any_signal() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 97.0);
    let pos = h.seed_long(BTC, 100.0).await;
    assert!(approx(pos.stop_loss, 98.0));

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 97.0]))
        .await;

    assert_eq!(h.gateway.closes(), 1);
    assert_eq!(h.gateway.opens(), 0);
    assert!(h.book.get(BTC).await.is_none());
    assert_eq!(engine.state(), EngineState::Idle);

    let events = h.notifier.events();
    assert!(matches!(events[0], TradeEvent::StopTriggered { price, .. } if approx(price, 97.0)));
    match &events[1] {
        TradeEvent::PositionClosed {
            trade,
            reason,
            remaining_size,
        } => {
            assert_eq!(*reason, CloseReason::StopLoss);
            assert!(approx(trade.realized_pnl, (97.0 - 100.0) * 0.01));
            assert!(approx(*remaining_size, 0.0));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_trend_opens_long_then_takes_profit() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 110.0);
    let mut engine = h.engine(BTC, trend_strategy(2.0));

    // 快线 105，慢线 100
    for snapshot in snapshots(BTC, 0, &[100.0, 95.0, 95.0, 100.0, 110.0]) {
        engine.process_batch(vec![snapshot]).await;
    }

    let pos = h.book.get(BTC).await.expect("long opened");
    assert_eq!(pos.side, Side::Long);
    assert!(approx(pos.size, 0.01));
    assert_eq!(pos.leverage, 10);
    assert!(approx(pos.entry_price, 110.0));
    assert!(approx(pos.stop_loss, 110.0 * 0.98));
    assert!(approx(pos.take_profit, 110.0 * 1.06));
    assert_eq!(h.notifier.kinds(), vec!["position_opened"]);

    h.gateway.set_fill_price(117.0);
    engine.process_batch(snapshots(BTC, 5, &[117.0])).await;

    assert!(h.book.get(BTC).await.is_none());
    let closed = h
        .notifier
        .events()
        .into_iter()
        .find_map(|e| match e {
            TradeEvent::PositionClosed { trade, reason, .. } => Some((trade, reason)),
            _ => None,
        })
        .expect("position closed");
    assert_eq!(closed.1, CloseReason::TakeProfit);
    assert!(approx(closed.0.realized_pnl, (117.0 - 110.0) * 0.01));
    assert!(h.notifier.kinds().contains(&"take_profit_triggered"));
}

#[tokio::test]
async fn test_opposite_signal_reverses_position() {
    let h = Harness::new(risk_config(10.0, 20.0, 3), 97.0);
    h.seed_long(BTC, 100.0).await;
    let mut engine = h.engine(BTC, trend_strategy(0.3));

    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 97.0]))
        .await;

    assert_eq!(h.gateway.closes(), 1);
    assert_eq!(h.gateway.opens(), 1);
    let pos = h.book.get(BTC).await.expect("reversed into short");
    assert_eq!(pos.side, Side::Short);
    assert!(approx(pos.entry_price, 97.0));
    assert!(approx(pos.stop_loss, 97.0 * 1.1));

    let reasons: Vec<CloseReason> = h
        .notifier
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TradeEvent::PositionClosed { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![CloseReason::Signal]);
}

#[tokio::test(start_paused = true)]
async fn test_close_timeout_twice_leaves_position_open() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 97.0);
    h.seed_long(BTC, 100.0).await;
    h.gateway.script_close(Step::Hang);
    h.gateway.script_close(Step::Hang);

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    let started = tokio::time::Instant::now();
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 97.0]))
        .await;

    // 两次超时加一次冷却
    assert!(started.elapsed() >= Duration::from_secs(90));
    assert_eq!(h.gateway.closes(), 2);
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.last_error().is_some());
    assert!(h.book.get(BTC).await.is_some());
    assert_eq!(
        h.notifier.kinds(),
        vec!["stop_triggered", "execution_failed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_after_cooldown() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 97.0);
    h.seed_long(BTC, 100.0).await;
    h.gateway
        .script_close(Step::Respond(OrderResult::Rejected("系统繁忙".to_string())));

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 97.0]))
        .await;

    assert_eq!(h.gateway.closes(), 2);
    assert!(h.book.get(BTC).await.is_none());
    assert!(!h.notifier.kinds().contains(&"execution_failed"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drops_pending_retry() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 97.0);
    h.seed_long(BTC, 100.0).await;
    h.gateway.script_close(Step::Hang);

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    let task = tokio::spawn(async move {
        engine
            .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 97.0]))
            .await;
        engine
    });

    // 第一次超时在 30s，冷却到 60s
    tokio::time::sleep(Duration::from_secs(40)).await;
    h.shutdown_tx.send(true).unwrap();
    let engine = task.await.unwrap();

    assert_eq!(h.gateway.closes(), 1);
    assert!(h.book.get(BTC).await.is_some());
    assert!(engine.last_error().is_some());
    assert!(!h.notifier.kinds().contains(&"execution_failed"));
}

#[tokio::test]
async fn test_partial_close_keeps_remainder() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 97.0);
    h.seed_long(BTC, 100.0).await;
    h.gateway.script_close(Step::Respond(OrderResult::Confirmed {
        fill_price: 97.0,
        filled_size: 0.004,
    }));

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 97.0]))
        .await;

    let pos = h.book.get(BTC).await.expect("remainder kept");
    assert!(approx(pos.size, 0.006));
    let remaining = h.notifier.events().into_iter().find_map(|e| match e {
        TradeEvent::PositionClosed {
            trade,
            remaining_size,
            ..
        } => Some((trade.size, remaining_size)),
        _ => None,
    });
    let (closed, remaining) = remaining.expect("partial close event");
    assert!(approx(closed, 0.004));
    assert!(approx(remaining, 0.006));
}

#[tokio::test]
async fn test_max_positions_shared_across_symbols() {
    let h = Harness::new(risk_config(2.0, 6.0, 1), 110.0);
    h.seed_long(ETH, 3_000.0).await;

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 95.0, 95.0, 100.0, 110.0]))
        .await;

    assert_eq!(h.gateway.opens(), 0);
    assert!(h.book.get(BTC).await.is_none());
    assert!(engine.last_error().is_some());
    let vetoed = h.notifier.events().into_iter().any(|e| {
        matches!(
            e,
            TradeEvent::ActionVetoed { ref veto }
                if veto.reason == VetoReason::MaxPositionsReached { open: 1, max: 1 }
        )
    });
    assert!(vetoed);
}

#[tokio::test]
async fn test_warmup_does_not_trade() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 110.0);
    let mut engine = h.engine(BTC, trend_strategy(2.0));
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 95.0, 95.0, 110.0]))
        .await;

    assert_eq!(h.gateway.opens(), 0);
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(h.notifier.events().is_empty());
}

#[tokio::test]
async fn test_operator_commands_through_handle() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 100.0);
    let (engine, handle) = TradingEngine::new(
        BTC,
        h.ctx.clone(),
        trend_strategy(2.0),
        h.shutdown_rx.clone(),
    );
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(engine.run(rx));

    handle
        .switch_strategy(StrategyKind::MeanReversion)
        .await
        .unwrap();
    handle
        .set_param("mean_reversion.rsi_overbought", 80.0)
        .await
        .unwrap();

    // 超买低于超卖，校验失败且不生效
    let err = handle
        .set_param("mean_reversion.rsi_overbought", 10.0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidParameter { .. }));
    let err = handle.set_param("unknown.threshold", 1.0).await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownStrategy(_)));

    let status = handle.status().await;
    assert_eq!(status.strategy.active, StrategyKind::MeanReversion);
    assert_eq!(status.strategy.params.mean_reversion.rsi_overbought, 80.0);
    assert_eq!(status.state, EngineState::Idle);

    let balance = handle.balance().await.unwrap();
    assert_eq!(balance.total, 1_000.0);

    drop(tx);
    task.await.unwrap();

    let kinds = h.notifier.kinds();
    assert_eq!(kinds.first(), Some(&"engine_started"));
    assert!(kinds.contains(&"strategy_switched"));
    assert_eq!(kinds.last(), Some(&"engine_stopped"));
    assert!(handle.switch_strategy(StrategyKind::Original).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_notifier_does_not_block_cycle() {
    let mut h = Harness::new(risk_config(2.0, 6.0, 3), 97.0);
    let stalled = Arc::new(StalledNotifier::default());
    h.ctx.notifier = stalled.clone();
    h.seed_long(BTC, 100.0).await;

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    let started = tokio::time::Instant::now();
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 97.0]))
        .await;

    // 两个事件各自等满 notify_timeout_secs 后放弃，交易状态照常推进
    let notify_timeout = Duration::from_secs(h.ctx.settings.notify_timeout_secs);
    assert!(started.elapsed() >= notify_timeout * 2);
    assert!(started.elapsed() < notify_timeout * 3);
    assert_eq!(h.gateway.closes(), 1);
    assert!(h.book.get(BTC).await.is_none());
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(
        stalled.inner.kinds(),
        vec!["stop_triggered", "position_closed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_channel_events_land_in_fallback_file() {
    let path = std::env::temp_dir()
        .join(format!("swapbot-engine-stalled-{}.jsonl", std::process::id()))
        .to_string_lossy()
        .to_string();
    let _ = std::fs::remove_file(&path);

    let mut h = Harness::new(risk_config(2.0, 6.0, 3), 97.0);
    let config = NotifierConfig {
        max_attempts: 1,
        delivery_budget_ms: 1_000,
        fallback_path: path.clone(),
        ..NotifierConfig::default()
    };
    assert!(config.delivery_budget_ms < h.ctx.settings.notify_timeout_secs * 1000);
    h.ctx.notifier = Arc::new(WebhookNotifier::with_channels(
        config,
        vec![Arc::new(StalledChannel)],
    ));
    h.seed_long(BTC, 100.0).await;

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 97.0]))
        .await;

    assert!(h.book.get(BTC).await.is_none());
    assert_eq!(engine.state(), EngineState::Idle);

    let contents = std::fs::read_to_string(&path).unwrap();
    let kinds: Vec<&'static str> = contents
        .lines()
        .map(|line| serde_json::from_str::<FallbackRecord>(line).unwrap().event.kind())
        .collect();
    assert_eq!(kinds, vec!["stop_triggered", "position_closed"]);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_pyramid_add_averages_entry_then_closes_full_size() {
    let mut risk = risk_config(2.0, 6.0, 3);
    risk.pyramid.enabled = true;
    let h = Harness::new(risk, 104.5);
    h.seed_long(BTC, 100.0).await;

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    // 最后一根收盘创出前 3 根的新高，RSI 约 52
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 104.0, 99.0, 98.0, 104.5]))
        .await;

    assert_eq!(h.gateway.increases(), 1);
    let pos = h.book.get(BTC).await.expect("position kept");
    assert!(approx(pos.size, 0.015));
    // (100 × 0.01 + 104.5 × 0.005) / 0.015
    assert!(approx(pos.entry_price, 101.5));
    assert_eq!(pos.pyramids, 1);
    assert_eq!(pos.last_add_price, Some(104.5));
    assert!(approx(pos.stop_loss, 98.0));
    assert_eq!(h.notifier.kinds(), vec!["position_increased"]);

    // 止盈价沿用首次开仓的 106，平掉全部 0.015
    h.gateway.set_fill_price(107.0);
    engine.process_batch(snapshots(BTC, 5, &[107.0])).await;

    assert!(h.book.get(BTC).await.is_none());
    let trade = h
        .notifier
        .events()
        .into_iter()
        .find_map(|e| match e {
            TradeEvent::PositionClosed { trade, .. } => Some(trade),
            _ => None,
        })
        .expect("position closed");
    assert!(approx(trade.size, 0.015));
    assert!(approx(trade.realized_pnl, (107.0 - 101.5) * 0.015));
}

#[tokio::test]
async fn test_pyramid_disabled_only_trails() {
    let h = Harness::new(risk_config(2.0, 6.0, 3), 104.5);
    h.seed_long(BTC, 100.0).await;

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 104.0, 99.0, 98.0, 104.5]))
        .await;

    assert_eq!(h.gateway.increases(), 0);
    let pos = h.book.get(BTC).await.unwrap();
    assert!(approx(pos.size, 0.01));
    assert!(approx(pos.stop_loss, 104.5 * 0.98));
    assert_eq!(h.notifier.kinds(), vec!["stop_adjusted"]);
}

#[tokio::test]
async fn test_anchored_atr_stop_closes_before_fixed_stop() {
    let mut risk = risk_config(5.0, 10.0, 3);
    risk.atr_stops.enabled = true;
    let h = Harness::new(risk, 96.5);
    let pos = h.seed_long(BTC, 100.0).await;
    assert!(approx(pos.stop_loss, 95.0));

    let mut engine = h.engine(BTC, trend_strategy(2.0));
    // 前 3 根低点 100，ATR = 3.5 / 3，锚定止损约 97.67
    engine
        .process_batch(snapshots(BTC, 0, &[100.0, 100.0, 100.0, 100.0, 96.5]))
        .await;

    assert_eq!(h.gateway.closes(), 1);
    assert!(h.book.get(BTC).await.is_none());
    let reasons: Vec<CloseReason> = h
        .notifier
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TradeEvent::PositionClosed { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![CloseReason::AnchoredStop]);
}
