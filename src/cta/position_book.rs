//! 共享持仓簿
//!
//! 所有交易对共用一个持仓簿，只有引擎的风控/成交路径会写入，
//! 其他读取方拿到的都是克隆的快照。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::types::{Position, Side};

#[derive(Debug, Default)]
struct BookInner {
    positions: HashMap<String, Position>,
    /// 已通过风控、等待成交的开仓，占用持仓名额
    pending_opens: HashSet<String>,
}

impl BookInner {
    fn occupied(&self) -> usize {
        self.positions.len()
            + self
                .pending_opens
                .iter()
                .filter(|s| !self.positions.contains_key(*s))
                .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    inner: Arc<RwLock<BookInner>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, symbol: &str) -> Option<Position> {
        self.inner.read().await.positions.get(symbol).cloned()
    }

    pub async fn find_by_id(&self, position_id: &str) -> Option<Position> {
        self.inner
            .read()
            .await
            .positions
            .values()
            .find(|p| p.id == position_id)
            .cloned()
    }

    /// 当前持仓数（含等待成交的开仓）
    pub async fn open_count(&self) -> usize {
        self.inner.read().await.occupied()
    }

    pub async fn snapshot(&self) -> Vec<Position> {
        let mut positions: Vec<Position> =
            self.inner.read().await.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// 预占开仓名额
    ///
    /// 该交易对已有持仓或预占，或总数已达上限时返回 false。
    pub async fn reserve_open(&self, symbol: &str, max_positions: usize) -> bool {
        let mut inner = self.inner.write().await;
        if inner.positions.contains_key(symbol) || inner.pending_opens.contains(symbol) {
            return false;
        }
        if inner.occupied() >= max_positions {
            return false;
        }
        inner.pending_opens.insert(symbol.to_string());
        true
    }

    /// 释放预占（开仓失败）
    pub async fn release(&self, symbol: &str) {
        self.inner.write().await.pending_opens.remove(symbol);
    }

    /// 开仓成交，写入持仓并释放预占
    pub async fn confirm_open(&self, position: Position) -> bool {
        let mut inner = self.inner.write().await;
        inner.pending_opens.remove(&position.symbol);
        if inner.positions.contains_key(&position.symbol) {
            log::error!("❌ {} 已存在持仓，拒绝重复写入", position.symbol);
            return false;
        }
        inner.positions.insert(position.symbol.clone(), position);
        true
    }

    /// 直接写入一个已存在的持仓，不经过预占与成交流程
    ///
    /// 供接入方在引擎启动前预置持仓（例如从交易所同步的仓位）。
    pub async fn restore(&self, position: Position) -> bool {
        let mut inner = self.inner.write().await;
        if inner.positions.contains_key(&position.symbol) {
            return false;
        }
        inner.positions.insert(position.symbol.clone(), position);
        true
    }

    /// 平仓成交：全部平掉时删除持仓，部分成交时缩减数量
    ///
    /// 返回平仓前的持仓和平仓后剩余的持仓。
    pub async fn apply_close(
        &self,
        symbol: &str,
        closed_size: f64,
    ) -> Option<(Position, Option<Position>)> {
        let mut inner = self.inner.write().await;
        let before = inner.positions.get(symbol)?.clone();
        let remaining = before.size - closed_size;
        // 按数量精度判断是否全部平掉
        if remaining <= before.size * 1e-9 {
            inner.positions.remove(symbol);
            Some((before, None))
        } else {
            let pos = inner.positions.get_mut(symbol)?;
            pos.size = remaining;
            Some((before, Some(pos.clone())))
        }
    }

    /// 加仓成交：按数量加权更新开仓价，止损止盈保持不变
    ///
    /// 返回加仓后的持仓。
    pub async fn apply_add(
        &self,
        symbol: &str,
        fill_price: f64,
        filled_size: f64,
    ) -> Option<Position> {
        let mut inner = self.inner.write().await;
        let pos = inner.positions.get_mut(symbol)?;
        let total = pos.size + filled_size;
        pos.entry_price = (pos.entry_price * pos.size + fill_price * filled_size) / total;
        pos.size = total;
        pos.pyramids += 1;
        pos.last_add_price = Some(fill_price);
        Some(pos.clone())
    }

    /// 更新止损，只允许向有利方向移动
    pub async fn adjust_stop(&self, symbol: &str, new_stop: f64, trigger_price: f64) -> bool {
        let mut inner = self.inner.write().await;
        let Some(pos) = inner.positions.get_mut(symbol) else {
            return false;
        };
        let tighter = match pos.side {
            Side::Long => new_stop > pos.stop_loss,
            Side::Short => new_stop < pos.stop_loss,
        };
        if !tighter {
            return false;
        }
        pos.stop_loss = new_stop;
        Self::track_best(pos, trigger_price);
        true
    }

    /// 记录最新价格，刷新持仓的最优价
    pub async fn observe_price(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.write().await;
        if let Some(pos) = inner.positions.get_mut(symbol) {
            Self::track_best(pos, price);
        }
    }

    fn track_best(pos: &mut Position, price: f64) {
        let better = match pos.side {
            Side::Long => price > pos.best_price,
            Side::Short => price < pos.best_price,
        };
        if better {
            pos.best_price = price;
        }
    }
}
