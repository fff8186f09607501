// 行情源与执行网关实现
pub mod paper;
pub mod replay;

pub use paper::{MarkPrices, PaperGateway};
pub use replay::ReplayProvider;
