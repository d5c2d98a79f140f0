use std::net::IpAddr;

use axum::http::HeaderMap;

use crate::utils::headers as header_names;

/// 无法识别客户端时的统一身份，所有此类请求共享一个计数桶
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// 解析调用方身份
///
/// 优先级：`X-Forwarded-For` 第一项 → `X-Real-IP` → 连接地址 → `"unknown"`。
/// 任何一层缺失或为空都继续向下，不会失败。
pub fn resolve_client_identity(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = headers
        .get(header_names::X_FORWARDED_FOR)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    let real_ip = || {
        headers
            .get(header_names::X_REAL_IP)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}
