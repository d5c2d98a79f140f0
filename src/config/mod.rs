use std::env;
use std::str::FromStr;
use std::time::Duration;

pub mod presets;

pub use presets::RateLimitConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// 进程级配置
#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub redis_url: Option<String>,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests: u32,
    pub health_check_interval_secs: u64,
    pub admission: AdmissionSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let escalation = EscalationPolicy {
            threshold: parse_var("BLOCK_THRESHOLD", 3)?,
            base_block: Duration::from_secs(parse_var("BLOCK_BASE_SECS", 300)?),
            multiplier: parse_var("BLOCK_MULTIPLIER", 2)?,
            max_block: Duration::from_secs(parse_var("BLOCK_MAX_SECS", 86_400)?),
            violation_window: Duration::from_secs(parse_var("VIOLATION_WINDOW_SECS", 86_400)?),
        };

        Ok(Config {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            server_port: parse_var("SERVER_PORT", 3000)?,
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
            rate_limit_window_secs: parse_var("RATE_LIMIT_WINDOW", 60)?,
            rate_limit_requests: parse_var("RATE_LIMIT_REQUESTS", 100)?,
            health_check_interval_secs: parse_var("RATE_LIMIT_HEALTH_INTERVAL", 10)?,
            admission: AdmissionSettings {
                enabled: parse_var("RATE_LIMIT_ENABLED", true)?,
                backend_timeout: Duration::from_millis(parse_var(
                    "RATE_LIMIT_BACKEND_TIMEOUT_MS",
                    200,
                )?),
                sweep_interval: Duration::from_secs(parse_var("RATE_LIMIT_SWEEP_INTERVAL", 300)?),
                escalation,
            },
        })
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// 未指定预设时使用的全局限流配置
    pub fn default_rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::new(
            self.rate_limit_window(),
            self.rate_limit_requests,
            "api",
            format!(
                "请求过于频繁，请在{}秒后重试",
                self.rate_limit_window_secs
            ),
        )
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(default),
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

/// 准入引擎参数
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    /// 总开关，关闭后所有请求直接放行
    pub enabled: bool,
    /// 共享存储单次调用超时
    pub backend_timeout: Duration,
    /// 本地存储清理周期
    pub sweep_interval: Duration,
    pub escalation: EscalationPolicy,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            backend_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_secs(300),
            escalation: EscalationPolicy::default(),
        }
    }
}

/// 违规升级策略
///
/// 达到 `threshold` 次违规后封禁，时长为
/// `min(base_block * multiplier^(violations - threshold), max_block)`。
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    pub threshold: u32,
    pub base_block: Duration,
    pub multiplier: u32,
    pub max_block: Duration,
    /// 违规计数的衰减窗口，每次违规刷新
    pub violation_window: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            base_block: Duration::from_secs(5 * 60),
            multiplier: 2,
            max_block: Duration::from_secs(24 * 60 * 60),
            violation_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl EscalationPolicy {
    /// 给定违规次数对应的封禁时长，未达阈值返回 None
    pub fn block_duration(&self, violations: u64) -> Option<Duration> {
        let threshold = u64::from(self.threshold.max(1));
        if violations < threshold {
            return None;
        }

        let exponent = u32::try_from(violations - threshold).unwrap_or(u32::MAX);
        let duration = self
            .multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.base_block.checked_mul(factor))
            .unwrap_or(self.max_block);

        Some(duration.min(self.max_block))
    }
}
