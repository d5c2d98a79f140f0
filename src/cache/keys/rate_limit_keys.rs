/// 封禁记录键前缀
const BLOCK_PREFIX: &str = "block:";

/// 违规计数键前缀
const VIOLATION_PREFIX: &str = "violations:";

/// 生成限流计数键 `prefix:identity[:endpoint]`
pub fn quota_key(prefix: &str, identity: &str, endpoint: Option<&str>) -> String {
    match endpoint {
        Some(endpoint) if !endpoint.is_empty() => format!("{}:{}:{}", prefix, identity, endpoint),
        _ => format!("{}:{}", prefix, identity),
    }
}

/// 生成封禁记录键，只按身份，不区分接口
pub fn block_key(identity: &str) -> String {
    format!("{}{}", BLOCK_PREFIX, identity)
}

/// 生成违规计数键
pub fn violation_key(identity: &str) -> String {
    format!("{}{}", VIOLATION_PREFIX, identity)
}
