use std::time::Duration;

/// 单个限流桶的配置，调用方按调用点提供
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    /// 逻辑桶命名空间，例如 "auth"、"upload"
    pub key_prefix: String,
    /// 被限流时返回给客户端的提示
    pub message: String,
}

impl RateLimitConfig {
    pub fn new(
        window: Duration,
        max_requests: u32,
        key_prefix: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            window,
            max_requests: max_requests.max(1),
            key_prefix: key_prefix.into(),
            message: message.into(),
        }
    }

    pub fn window_ms(&self) -> i64 {
        crate::utils::clock::duration_millis(self.window)
    }

    /// 登录、注册等认证接口：15 分钟 5 次
    pub fn auth() -> Self {
        Self::new(
            Duration::from_secs(15 * 60),
            5,
            "auth",
            "登录尝试次数过多，请15分钟后再试",
        )
    }

    /// 文件上传：1 小时 20 次
    pub fn upload() -> Self {
        Self::new(
            Duration::from_secs(60 * 60),
            20,
            "upload",
            "上传过于频繁，请稍后再试",
        )
    }

    /// 写操作：1 分钟 30 次
    pub fn mutation() -> Self {
        Self::new(
            Duration::from_secs(60),
            30,
            "mutation",
            "操作过于频繁，请稍后再试",
        )
    }

    /// 敏感操作（改密码、导出等）：1 小时 3 次
    pub fn sensitive() -> Self {
        Self::new(
            Duration::from_secs(60 * 60),
            3,
            "sensitive",
            "敏感操作次数已达上限，请1小时后再试",
        )
    }

    /// 文档识别等重计算接口：1 分钟 10 次
    pub fn ai() -> Self {
        Self::new(
            Duration::from_secs(60),
            10,
            "ai",
            "智能处理请求过于频繁，请稍后再试",
        )
    }

    /// 通用 API：1 分钟 100 次
    pub fn api() -> Self {
        Self::new(
            Duration::from_secs(60),
            100,
            "api",
            "请求过于频繁，请稍后再试",
        )
    }

    /// 按名称查找预设
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "auth" => Some(Self::auth()),
            "upload" => Some(Self::upload()),
            "mutation" => Some(Self::mutation()),
            "sensitive" => Some(Self::sensitive()),
            "ai" => Some(Self::ai()),
            "api" => Some(Self::api()),
            _ => None,
        }
    }
}
