//! 回放行情源：按行读取 `<replay_dir>/<symbol>.jsonl`，每行一个行情快照

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::core::error::{EngineError, Result};
use crate::core::exchange::MarketDataProvider;
use crate::core::types::MarketSnapshot;
use crate::exchanges::paper::MarkPrices;

pub struct ReplayProvider {
    dir: PathBuf,
    queues: Mutex<HashMap<String, VecDeque<MarketSnapshot>>>,
    marks: Option<MarkPrices>,
}

impl ReplayProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            queues: Mutex::new(HashMap::new()),
            marks: None,
        }
    }

    /// 每次取出快照时同步更新标记价格（供模拟盘成交）
    pub fn with_marks(mut self, marks: MarkPrices) -> Self {
        self.marks = Some(marks);
        self
    }

    pub fn file_for(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", symbol.replace('/', "-")))
    }

    async fn load(&self, symbol: &str) -> Result<VecDeque<MarketSnapshot>> {
        let path = self.file_for(symbol);
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            EngineError::MarketData(format!("读取回放文件 {} 失败: {}", path.display(), e))
        })?;

        let mut snapshots = VecDeque::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<MarketSnapshot>(line) {
                Ok(snapshot) => snapshots.push_back(snapshot),
                Err(e) => log::warn!(
                    "⚠️ 跳过无法解析的回放数据 {}:{}: {}",
                    path.display(),
                    lineno + 1,
                    e
                ),
            }
        }
        log::info!("📂 加载回放数据 {}: {} 条", path.display(), snapshots.len());
        Ok(snapshots)
    }
}

#[async_trait]
impl MarketDataProvider for ReplayProvider {
    fn name(&self) -> &str {
        "replay"
    }

    async fn poll(&self, symbol: &str) -> Result<MarketSnapshot> {
        let mut queues = self.queues.lock().await;
        if !queues.contains_key(symbol) {
            let loaded = self.load(symbol).await?;
            queues.insert(symbol.to_string(), loaded);
        }

        let snapshot = queues
            .get_mut(symbol)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| EngineError::FeedExhausted(symbol.to_string()))?;
        drop(queues);

        if let Some(marks) = &self.marks {
            marks
                .write()
                .await
                .insert(snapshot.symbol.clone(), snapshot.last_price);
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn test_replays_lines_in_order_then_exhausts() {
        let dir = std::env::temp_dir().join(format!("swapbot-replay-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("BTC-USDT-SWAP.jsonl"),
            concat!(
                r#"{"symbol":"BTC-USDT-SWAP","timestamp":"2024-01-01T00:00:00Z","last_price":100.0}"#,
                "\n",
                "not json\n",
                r#"{"symbol":"BTC-USDT-SWAP","timestamp":"2024-01-01T00:01:00Z","last_price":101.5}"#,
                "\n"
            ),
        )
        .unwrap();

        let marks: MarkPrices = Arc::new(RwLock::new(HashMap::new()));
        let provider = ReplayProvider::new(&dir).with_marks(marks.clone());

        assert_eq!(provider.poll("BTC-USDT-SWAP").await.unwrap().last_price, 100.0);
        assert_eq!(provider.poll("BTC-USDT-SWAP").await.unwrap().last_price, 101.5);
        assert_eq!(marks.read().await.get("BTC-USDT-SWAP"), Some(&101.5));
        assert!(matches!(
            provider.poll("BTC-USDT-SWAP").await,
            Err(EngineError::FeedExhausted(_))
        ));
        assert!(matches!(
            provider.poll("ETH-USDT-SWAP").await,
            Err(EngineError::MarketData(_))
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
