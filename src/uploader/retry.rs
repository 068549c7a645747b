// 重试策略引擎
//
// 分类规则（按序判定）：
// 1. 取消信号永不重试
// 2. 超时可重试（除非显式关闭超时重试）
// 3. 无状态码视为网络错误，可重试
// 4. 5xx 可重试
// 5. 4xx 中仅 408 / 429 可重试，其余为终态
// 6. 其余归为 Unknown，不重试
//
// 退避：delay = min(base * multiplier^attempt, max_delay)
// 按错误类别的覆盖表优先于指数公式与全局重试次数；
// 可插拔策略对象可整体替换 should_retry / delay

use crate::config::{RetryOverride, UploadConfig};
use crate::transport::UploadError;
use std::sync::Arc;
use std::time::Duration;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// 连接层失败（可重试）
    Network,
    /// 超时（默认可重试）
    Timeout,
    /// 5xx（可重试）
    Server,
    /// 4xx（仅 408/429 可重试）
    Client,
    /// 已取消（永不重试）
    Cancelled,
    /// 无法归类（不重试）
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Server => "server",
            ErrorClass::Client => "client",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// 可重试的 4xx 状态码
const RETRIABLE_CLIENT_CODES: [u16; 2] = [408, 429];

/// 错误分类
pub fn classify(error: &UploadError) -> ErrorClass {
    match error {
        UploadError::Cancelled => ErrorClass::Cancelled,
        UploadError::Timeout => ErrorClass::Timeout,
        UploadError::Network(_) => ErrorClass::Network,
        UploadError::Status { status, .. } => {
            if (500..=599).contains(status) {
                ErrorClass::Server
            } else if (400..=499).contains(status) {
                ErrorClass::Client
            } else {
                ErrorClass::Unknown
            }
        }
        UploadError::Protocol(_) | UploadError::Io(_) => ErrorClass::Unknown,
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 全局最大重试次数
    pub max_retries: u32,
    /// 初始退避延迟
    pub base_delay: Duration,
    /// 退避倍数
    pub backoff_multiplier: f64,
    /// 退避延迟上限
    pub max_delay: Duration,
    /// 超时错误是否参与重试
    pub retry_on_timeout: bool,
    /// 按类别覆盖（优先于指数公式与全局次数）
    overrides: Vec<(ErrorClass, RetryOverride)>,
}

impl RetryPolicy {
    /// 从上传配置构造
    pub fn from_config(config: &UploadConfig, max_retries_override: Option<u32>) -> Self {
        let mut overrides = Vec::new();
        if let Some(entry) = config.retry_overrides.network {
            overrides.push((ErrorClass::Network, entry));
        }
        if let Some(entry) = config.retry_overrides.timeout {
            overrides.push((ErrorClass::Timeout, entry));
        }
        if let Some(entry) = config.retry_overrides.server {
            overrides.push((ErrorClass::Server, entry));
        }
        if let Some(entry) = config.retry_overrides.client {
            overrides.push((ErrorClass::Client, entry));
        }

        Self {
            max_retries: max_retries_override.unwrap_or(config.max_retries),
            base_delay: Duration::from_millis(config.retry_delay_ms),
            backoff_multiplier: config.retry_backoff,
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            retry_on_timeout: config.retry_on_timeout,
            overrides,
        }
    }

    fn override_for(&self, class: ErrorClass) -> Option<&RetryOverride> {
        self.overrides
            .iter()
            .find(|(entry_class, _)| *entry_class == class)
            .map(|(_, entry)| entry)
    }

    /// 该错误类别本身是否可重试
    pub fn class_retriable(&self, class: ErrorClass, error: &UploadError) -> bool {
        match class {
            ErrorClass::Cancelled | ErrorClass::Unknown => false,
            ErrorClass::Timeout => self.retry_on_timeout,
            ErrorClass::Network | ErrorClass::Server => true,
            ErrorClass::Client => error
                .status_code()
                .map(|code| RETRIABLE_CLIENT_CODES.contains(&code))
                .unwrap_or(false),
        }
    }

    /// 第 attempt 次失败后是否重试（attempt 从 0 起）
    pub fn should_retry(&self, error: &UploadError, attempt: u32) -> bool {
        let class = classify(error);
        if !self.class_retriable(class, error) {
            return false;
        }

        // 类别覆盖的次数上限优先于全局
        let budget = self
            .override_for(class)
            .map(|entry| entry.max_retries)
            .unwrap_or(self.max_retries);
        attempt < budget
    }

    /// 第 attempt 次重试前的等待时长
    pub fn delay(&self, attempt: u32, error: &UploadError) -> Duration {
        let class = classify(error);

        // 类别覆盖提供固定延迟
        if let Some(entry) = self.override_for(class) {
            return Duration::from_millis(entry.delay_ms);
        }

        let backoff =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = (backoff as u64).min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }
}

/// 可插拔重试决策器
///
/// 实现此 trait 可整体替换默认的 should_retry / delay
pub trait RetryDecider: Send + Sync {
    fn should_retry(&self, error: &UploadError, attempt: u32) -> bool;
    fn delay(&self, attempt: u32, error: &UploadError) -> Duration;
}

/// 重试策略的带标签变体
///
/// 动态的 boolean / 策略对象 / 配置对象三态在入队时一次性解析为本类型
#[derive(Clone)]
pub enum RetryStrategy {
    /// 关闭重试
    Disabled,
    /// 简单计数重试（使用全局退避参数）
    Simple(u32),
    /// 自定义决策器
    Custom(Arc<dyn RetryDecider>),
}

impl std::fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryStrategy::Disabled => write!(f, "RetryStrategy::Disabled"),
            RetryStrategy::Simple(count) => write!(f, "RetryStrategy::Simple({})", count),
            RetryStrategy::Custom(_) => write!(f, "RetryStrategy::Custom(..)"),
        }
    }
}

/// 入队时解析出的生效策略
#[derive(Debug, Clone)]
pub enum ResolvedRetry {
    /// 永不重试
    Never,
    /// 默认策略
    Policy(RetryPolicy),
    /// 自定义决策器
    Decider(Arc<dyn RetryDecider>),
}

impl std::fmt::Debug for dyn RetryDecider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RetryDecider")
    }
}

impl ResolvedRetry {
    /// 解析策略变体（入队时调用一次）
    ///
    /// smart_retry 关闭时分类规则退化：仍然永不重试取消，其余按简单计数
    pub fn resolve(strategy: &RetryStrategy, config: &UploadConfig, max_retries_override: Option<u32>) -> Self {
        match strategy {
            RetryStrategy::Disabled => ResolvedRetry::Never,
            RetryStrategy::Simple(count) => {
                let mut policy = RetryPolicy::from_config(config, max_retries_override);
                policy.max_retries = *count;
                ResolvedRetry::Policy(policy)
            }
            RetryStrategy::Custom(decider) => ResolvedRetry::Decider(decider.clone()),
        }
    }

    /// 默认策略（smart_retry 路径）
    pub fn from_config(config: &UploadConfig, max_retries_override: Option<u32>) -> Self {
        ResolvedRetry::Policy(RetryPolicy::from_config(config, max_retries_override))
    }

    pub fn should_retry(&self, error: &UploadError, attempt: u32) -> bool {
        // 取消在任何策略下都不重试
        if matches!(error, UploadError::Cancelled) {
            return false;
        }
        match self {
            ResolvedRetry::Never => false,
            ResolvedRetry::Policy(policy) => policy.should_retry(error, attempt),
            ResolvedRetry::Decider(decider) => decider.should_retry(error, attempt),
        }
    }

    pub fn delay(&self, attempt: u32, error: &UploadError) -> Duration {
        match self {
            ResolvedRetry::Never => Duration::ZERO,
            ResolvedRetry::Policy(policy) => policy.delay(attempt, error),
            ResolvedRetry::Decider(decider) => decider.delay(attempt, error),
        }
    }
}
