use anyhow::{bail, Context};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};

use swapbot::core::config::AppConfig;
use swapbot::core::exchange::{ExecutionGateway, MarketDataProvider};
use swapbot::core::risk_manager::RiskManager;
use swapbot::cta::{spawn_feed, EngineContext, PositionBook, TradingEngine};
use swapbot::exchanges::{MarkPrices, PaperGateway, ReplayProvider};
use swapbot::strategies::StrategyKind;
use swapbot::utils::position_reporter::PositionReporter;
use swapbot::utils::unified_logger::init_logger;
use swapbot::utils::webhook::{Notifier, WebhookNotifier};

/// 永续合约信号交易机器人
#[derive(Debug, Parser)]
#[command(name = "swapbot", version, about = "永续合约信号交易机器人")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, value_name = "FILE", default_value = "config/config.yaml")]
    config: String,

    /// 覆盖配置中的策略: triple_signal, volatility_breakout, trend_following, mean_reversion, original
    #[arg(short, long, value_name = "STRATEGY")]
    strategy: Option<String>,

    /// 强制模拟盘
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_file(&cli.config)
        .with_context(|| format!("加载配置文件 {} 失败", cli.config))?;
    let _log_handle = init_logger(&config.logging)?;

    if let Some(id) = &cli.strategy {
        let kind: StrategyKind = id.parse()?;
        log::info!("🔧 命令行覆盖策略: {}", kind.display_name());
        config.strategy.active = kind;
    }
    if cli.dry_run {
        config.trading.dry_run = true;
    }
    if !config.trading.dry_run {
        bail!("当前版本只提供模拟盘执行网关，请设置 trading.dry_run = true");
    }

    log::info!("========================================");
    log::info!("🚀 swapbot 启动");
    log::info!("📋 交易对: {}", config.trading.symbols.join(", "));
    log::info!("📊 策略: {}", config.strategy.active.display_name());
    log::info!(
        "⚖️ 杠杆 {}x，单笔 {}，最多 {} 个持仓",
        config.risk.leverage,
        config.risk.position_size,
        config.risk.max_positions
    );
    log::info!("========================================");

    let book = PositionBook::new();
    let marks: MarkPrices = Arc::new(RwLock::new(HashMap::new()));
    let gateway: Arc<dyn ExecutionGateway> =
        Arc::new(PaperGateway::new(&config.paper, book.clone(), marks.clone()));
    let provider: Arc<dyn MarketDataProvider> =
        Arc::new(ReplayProvider::new(&config.market_data.replay_dir).with_marks(marks));
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(config.notifier.clone()));

    let ctx = EngineContext {
        risk: Arc::new(RiskManager::new(config.risk.clone())),
        book,
        gateway,
        notifier: notifier.clone(),
        settings: config.engine.clone(),
        indicators: config.indicators.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_interval = Duration::from_secs(config.trading.poll_interval_secs);
    let mut handles = Vec::new();
    let mut engines = Vec::new();
    let mut feeds = Vec::new();

    for symbol in &config.trading.symbols {
        let (tx, rx) = mpsc::channel(config.engine.snapshot_buffer);
        feeds.push(spawn_feed(
            provider.clone(),
            symbol.clone(),
            poll_interval,
            tx,
            shutdown_rx.clone(),
        ));

        let (engine, handle) = TradingEngine::new(
            symbol,
            ctx.clone(),
            config.strategy.clone(),
            shutdown_rx.clone(),
        );
        handles.push(handle);
        engines.push(tokio::spawn(engine.run(rx)));
    }

    let reporter = if config.trading.report_interval_secs > 0 {
        let reporter = Arc::new(PositionReporter::new(
            handles.clone(),
            notifier,
            Duration::from_secs(config.trading.report_interval_secs),
        ));
        Some(reporter.start(shutdown_rx.clone()))
    } else {
        None
    };

    let all_engines = wait_engines(engines);
    tokio::pin!(all_engines);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("监听停止信号失败")?;
            log::info!("收到停止信号，正在关闭...");
            let _ = shutdown_tx.send(true);
            all_engines.await;
        }
        _ = &mut all_engines => {
            log::info!("📭 全部交易引擎已结束");
            let _ = shutdown_tx.send(true);
        }
    }

    for feed in feeds {
        let _ = feed.await;
    }
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    for handle in &handles {
        let status = handle.status().await;
        if let Some(pos) = status.position {
            log::warn!(
                "⚠️ {} 退出时仍有 {} 持仓 {} @ {:.4}",
                handle.symbol(),
                pos.side,
                pos.size,
                pos.entry_price
            );
        }
    }
    log::info!("✅ swapbot 已停止");
    Ok(())
}

/// 等待全部引擎任务结束
async fn wait_engines(engines: Vec<tokio::task::JoinHandle<()>>) {
    for engine in engines {
        if let Err(e) = engine.await {
            log::error!("❌ 交易引擎任务异常退出: {}", e);
        }
    }
}
