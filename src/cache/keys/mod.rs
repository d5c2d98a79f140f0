/// 缓存键模块
/// 提供限流相关的缓存键生成函数
pub mod rate_limit_keys;

pub use rate_limit_keys::{block_key, quota_key, violation_key};
