//! 模拟盘执行网关
//!
//! 按最新标记价格立即成交，维护保证金占用与已实现盈亏，不连接任何交易所。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::config::PaperConfig;
use crate::core::error::Result;
use crate::core::exchange::ExecutionGateway;
use crate::core::types::{realized_pnl, Balance, OrderResult, Side};
use crate::cta::position_book::PositionBook;

/// 各交易对的最新标记价格，由行情源写入
pub type MarkPrices = Arc<RwLock<HashMap<String, f64>>>;

#[derive(Debug, Clone)]
struct Lot {
    side: Side,
    entry_price: f64,
    size: f64,
    margin: f64,
}

#[derive(Debug)]
struct PaperAccount {
    /// 初始资金 + 已实现盈亏
    cash: f64,
    lots: HashMap<String, Lot>,
}

impl PaperAccount {
    fn used_margin(&self) -> f64 {
        self.lots.values().map(|l| l.margin).sum()
    }
}

pub struct PaperGateway {
    currency: String,
    book: PositionBook,
    marks: MarkPrices,
    account: RwLock<PaperAccount>,
}

impl PaperGateway {
    pub fn new(config: &PaperConfig, book: PositionBook, marks: MarkPrices) -> Self {
        log::info!(
            "📝 模拟盘初始化，初始资金 {} {}",
            config.initial_balance,
            config.currency
        );
        Self {
            currency: config.currency.clone(),
            book,
            marks,
            account: RwLock::new(PaperAccount {
                cash: config.initial_balance,
                lots: HashMap::new(),
            }),
        }
    }

    async fn mark(&self, symbol: &str) -> Option<f64> {
        self.marks
            .read()
            .await
            .get(symbol)
            .copied()
            .filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn submit_open(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
    ) -> OrderResult {
        let Some(price) = self.mark(symbol).await else {
            return OrderResult::Rejected(format!("{} 暂无行情价格", symbol));
        };

        let mut account = self.account.write().await;
        if account.lots.contains_key(symbol) {
            return OrderResult::Rejected(format!("{} 已有模拟持仓", symbol));
        }
        let margin = price * size / leverage.max(1) as f64;
        let available = account.cash - account.used_margin();
        if margin > available {
            return OrderResult::Rejected(format!(
                "可用保证金不足: 需要 {:.4}, 可用 {:.4}",
                margin, available
            ));
        }

        account.lots.insert(
            symbol.to_string(),
            Lot {
                side,
                entry_price: price,
                size,
                margin,
            },
        );
        log::info!(
            "📝 模拟开仓 {} {} {} @ {:.4} (止损 {:.4}, 止盈 {:.4})",
            symbol,
            side,
            size,
            price,
            stop_loss,
            take_profit
        );
        OrderResult::Confirmed {
            fill_price: price,
            filled_size: size,
        }
    }

    async fn submit_increase(&self, position_id: &str, size: f64) -> OrderResult {
        let Some(position) = self.book.find_by_id(position_id).await else {
            return OrderResult::Rejected(format!("未知持仓 {}", position_id));
        };
        let Some(price) = self.mark(&position.symbol).await else {
            return OrderResult::Rejected(format!("{} 暂无行情价格", position.symbol));
        };

        let mut account = self.account.write().await;
        let margin = price * size / position.leverage.max(1) as f64;
        let available = account.cash - account.used_margin();
        if margin > available {
            return OrderResult::Rejected(format!(
                "可用保证金不足: 需要 {:.4}, 可用 {:.4}",
                margin, available
            ));
        }

        let lot = account.lots.entry(position.symbol.clone()).or_insert(Lot {
            side: position.side,
            entry_price: position.entry_price,
            size: position.size,
            margin: 0.0,
        });
        lot.entry_price = (lot.entry_price * lot.size + price * size) / (lot.size + size);
        lot.size += size;
        lot.margin += margin;
        log::info!(
            "📝 模拟加仓 {} {} {} @ {:.4}，持仓 {} 均价 {:.4}",
            position.symbol,
            position.side,
            size,
            price,
            lot.size,
            lot.entry_price
        );
        OrderResult::Confirmed {
            fill_price: price,
            filled_size: size,
        }
    }

    async fn submit_close(&self, position_id: &str) -> OrderResult {
        let Some(position) = self.book.find_by_id(position_id).await else {
            return OrderResult::Rejected(format!("未知持仓 {}", position_id));
        };
        let Some(price) = self.mark(&position.symbol).await else {
            return OrderResult::Rejected(format!("{} 暂无行情价格", position.symbol));
        };

        let mut account = self.account.write().await;
        // 启动时恢复的持仓在模拟账户里没有记录，按持仓簿结算
        let lot = account.lots.remove(&position.symbol).unwrap_or(Lot {
            side: position.side,
            entry_price: position.entry_price,
            size: position.size,
            margin: 0.0,
        });
        let pnl = realized_pnl(lot.side, lot.entry_price, price, lot.size);
        account.cash += pnl;
        log::info!(
            "📝 模拟平仓 {} @ {:.4}，盈亏 {:+.4}",
            position.symbol,
            price,
            pnl
        );
        OrderResult::Confirmed {
            fill_price: price,
            filled_size: lot.size,
        }
    }

    async fn query_balance(&self) -> Result<Balance> {
        let marks = self.marks.read().await.clone();
        let account = self.account.read().await;
        let unrealized: f64 = account
            .lots
            .iter()
            .filter_map(|(symbol, lot)| {
                marks
                    .get(symbol)
                    .map(|p| realized_pnl(lot.side, lot.entry_price, *p, lot.size))
            })
            .sum();
        Ok(Balance {
            currency: self.currency.clone(),
            total: account.cash + unrealized,
            available: account.cash - account.used_margin(),
        })
    }
}
