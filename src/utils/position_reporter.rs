use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::core::types::Side;
use crate::cta::engine::shutdown_requested;
use crate::cta::handle::{EngineHandle, EngineStatus};
use crate::utils::webhook::{Notifier, TradeEvent};

/// 单个交易对的状态文本
pub fn format_status(status: &EngineStatus, now: DateTime<Utc>) -> String {
    let mut content = format!(
        "**{}** [{}] 策略: {}\n",
        status.symbol,
        status.state,
        status.strategy.active.display_name()
    );

    if let Some(price) = status.last_price {
        content.push_str(&format!("最新价: {:.4}\n", price));
    }

    match &status.position {
        Some(pos) => {
            let side = if pos.side == Side::Long { "多" } else { "空" };
            content.push_str(&format!(
                "持仓: {} {:.4}@{:.4} {}x\n止损: {:.4} 止盈: {:.4}\n持仓时长: {:.1}h\n",
                side,
                pos.size,
                pos.entry_price,
                pos.leverage,
                pos.stop_loss,
                pos.take_profit,
                pos.holding_hours(now)
            ));
            if let Some(price) = status.last_price {
                let pnl = pos.unrealized_pnl(price);
                let pnl_str = if pnl >= 0.0 {
                    format!("+{:.4}", pnl)
                } else {
                    format!("{:.4}", pnl)
                };
                content.push_str(&format!(
                    "浮动盈亏: {} ({:+.2}%)\n",
                    pnl_str,
                    pos.price_return_pct(price) * pos.leverage as f64
                ));
            }
        }
        None => content.push_str("当前无持仓\n"),
    }

    if let Some(signal) = &status.last_signal {
        content.push_str(&format!(
            "最近信号: {:?} ({:.2}) {}\n",
            signal.direction, signal.confidence, signal.reason
        ));
    }
    if let Some(err) = &status.last_error {
        content.push_str(&format!("最近错误: {}\n", err));
    }
    content
}

/// 仓位报告服务
pub struct PositionReporter {
    handles: Vec<EngineHandle>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
}

impl PositionReporter {
    pub fn new(handles: Vec<EngineHandle>, notifier: Arc<dyn Notifier>, interval: Duration) -> Self {
        Self {
            handles,
            notifier,
            interval,
        }
    }

    /// 汇总全部交易对的报告
    pub async fn build_report(&self) -> String {
        let now = Utc::now();
        let mut content = format!("📊 **仓位报告**\n时间: {}\n\n", now.format("%Y-%m-%d %H:%M UTC"));

        if let Some(first) = self.handles.first() {
            match first.balance().await {
                Ok(balance) => content.push_str(&format!(
                    "账户: 总额 {:.2} {}，可用 {:.2}\n\n",
                    balance.total, balance.currency, balance.available
                )),
                Err(e) => log::warn!("查询余额失败: {}", e),
            }
        }

        for handle in &self.handles {
            content.push_str(&format_status(&handle.status().await, now));
            content.push('\n');
        }
        content
    }

    /// 启动定期报告任务
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        log::info!("📊 启动仓位报告服务（间隔 {} 秒）", self.interval.as_secs());
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // 第一次 tick 立即返回，跳过启动时的空报告
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = ticker.tick() => {
                        let content = self.build_report().await;
                        if let Err(e) = self.notifier.notify(&TradeEvent::StatusReport { content }).await {
                            log::error!("发送仓位报告失败: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Position;
    use crate::strategies::{StrategyKind, StrategySettings};
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_status_with_position() {
        let now = Utc::now();
        let mut status = EngineStatus::new("BTC-USDT-SWAP", StrategySettings::new(StrategyKind::Original));
        status.last_price = Some(95.0);
        status.position = Some(Position {
            id: "p1".to_string(),
            symbol: "BTC-USDT-SWAP".to_string(),
            side: Side::Short,
            entry_price: 100.0,
            size: 2.0,
            leverage: 10,
            stop_loss: 103.0,
            take_profit: 94.0,
            opened_at: now - ChronoDuration::hours(3),
            best_price: 95.0,
            pyramids: 0,
            last_add_price: None,
        });

        let text = format_status(&status, now);
        assert!(text.contains("原始震荡下跌策略"));
        assert!(text.contains("空 2.0000@100.0000 10x"));
        assert!(text.contains("+10.0000"));
        assert!(text.contains("3.0h"));
    }

    #[test]
    fn test_status_without_position() {
        let status = EngineStatus::new("ETH-USDT-SWAP", StrategySettings::default());
        assert!(format_status(&status, Utc::now()).contains("当前无持仓"));
    }
}
