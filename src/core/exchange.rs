use async_trait::async_trait;

use crate::core::error::Result;
use crate::core::types::{Balance, MarketSnapshot, OrderResult, Side};

/// 行情数据源
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// 数据源名称
    fn name(&self) -> &str;

    /// 拉取最新行情快照
    async fn poll(&self, symbol: &str) -> Result<MarketSnapshot>;
}

/// 下单执行接口
///
/// 下单失败不以错误返回，而是体现在 `OrderResult` 中。
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    fn name(&self) -> &str;

    /// 开仓，止损止盈随开仓一起提交
    async fn submit_open(
        &self,
        symbol: &str,
        side: Side,
        size: f64,
        leverage: u32,
        stop_loss: f64,
        take_profit: f64,
    ) -> OrderResult;

    /// 在已有持仓上同方向加仓
    async fn submit_increase(&self, position_id: &str, size: f64) -> OrderResult;

    /// 平掉指定持仓
    async fn submit_close(&self, position_id: &str) -> OrderResult;

    /// 查询账户余额（只读）
    async fn query_balance(&self) -> Result<Balance>;
}
