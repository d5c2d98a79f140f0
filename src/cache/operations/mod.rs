/// 缓存操作
/// 限流存储后端的具体实现

// 进程内存储，降级时使用
pub mod local;

// Redis 共享存储
pub mod redis_store;

pub use local::LocalStore;
pub use redis_store::RedisStore;
