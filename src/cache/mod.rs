// 缓存模块
// 包含限流状态的数据结构、存储接口和后端实现

pub mod keys;
pub mod models;
pub mod operations;
pub mod store;

// 重新导出常用类型，方便其他模块使用
pub use models::{CachedBlock, WindowCount};
pub use operations::{LocalStore, RedisStore};
pub use store::{RateLimitStore, StoreError};
