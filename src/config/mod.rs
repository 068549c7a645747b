// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 服务端接口配置
    #[serde(default)]
    pub endpoints: EndpointConfig,
    /// 入队校验配置
    #[serde(default)]
    pub validation: ValidationConfig,
    /// 缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 网络自适应配置
    #[serde(default)]
    pub adaptation: AdaptationConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 上传配置
///
/// 生命周期：引擎创建时构造一次。并发与分片大小字段会被
/// 网络自适应控制器在运行时改写；显式的配置更新整体替换
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 单任务最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 默认分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 分片大小下限
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 分片大小上限
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// 分片请求超时（秒），自适应开启时会被动态改写
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// 分片启动错峰延迟（毫秒），index > 2 的分片按此延迟错开发车
    #[serde(default = "default_chunk_stagger_ms")]
    pub chunk_stagger_ms: u64,

    // === 重试参数 ===
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 退避倍数
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    /// 退避延迟上限（毫秒）
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    /// 按错误类别覆盖重试参数（优先于指数退避公式与全局重试次数）
    #[serde(default)]
    pub retry_overrides: RetryOverrides,

    // === 功能开关 ===
    /// 断点续传
    #[serde(default = "default_true")]
    pub enable_resume: bool,
    /// 秒传（文件级去重）
    #[serde(default = "default_true")]
    pub enable_dedup: bool,
    /// 压缩（由调用方在入队前执行，引擎只携带开关）
    #[serde(default)]
    pub enable_compression: bool,
    /// 缓存（秒传标记 + 续传快照）
    #[serde(default = "default_true")]
    pub enable_cache: bool,
    /// 网络自适应
    #[serde(default = "default_true")]
    pub enable_adaptation: bool,
    /// 智能重试（错误分类感知），关闭时退化为简单计数重试
    #[serde(default = "default_true")]
    pub smart_retry: bool,
    /// 超时错误是否参与重试
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
    /// 合并请求失败是否重试（默认不重试，合并不保证幂等）
    #[serde(default)]
    pub retry_merge: bool,
}

/// 按错误类别的重试覆盖项
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryOverride {
    /// 该类别的最大重试次数
    pub max_retries: u32,
    /// 该类别的固定重试延迟（毫秒）
    pub delay_ms: u64,
}

/// 覆盖表：任一类别为 None 时使用全局指数退避
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<RetryOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<RetryOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<RetryOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<RetryOverride>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            chunk_stagger_ms: default_chunk_stagger_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff: default_retry_backoff(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            retry_overrides: RetryOverrides::default(),
            enable_resume: true,
            enable_dedup: true,
            enable_compression: false,
            enable_cache: true,
            enable_adaptation: true,
            smart_retry: true,
            retry_on_timeout: true,
            retry_merge: false,
        }
    }
}

fn default_max_concurrent_files() -> usize {
    3
}
fn default_max_concurrent_chunks() -> usize {
    6
}
fn default_chunk_size() -> u64 {
    4 * 1024 * 1024
}
fn default_min_chunk_size() -> u64 {
    1024 * 1024
}
fn default_max_chunk_size() -> u64 {
    32 * 1024 * 1024
}
fn default_chunk_timeout_secs() -> u64 {
    60
}
fn default_chunk_stagger_ms() -> u64 {
    50
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_retry_backoff() -> f64 {
    2.0
}
fn default_max_retry_delay_ms() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}

/// 服务端接口配置（三个上传相关端点）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 分片上传接口
    #[serde(default = "default_chunk_upload_url")]
    pub chunk_upload_url: String,
    /// 分片合并接口
    #[serde(default = "default_merge_url")]
    pub merge_url: String,
    /// 文件存在性检查（秒传）接口
    #[serde(default = "default_exists_url")]
    pub exists_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            chunk_upload_url: default_chunk_upload_url(),
            merge_url: default_merge_url(),
            exists_url: default_exists_url(),
        }
    }
}

fn default_chunk_upload_url() -> String {
    "http://127.0.0.1:8080/api/upload/chunk".to_string()
}
fn default_merge_url() -> String {
    "http://127.0.0.1:8080/api/upload/merge".to_string()
}
fn default_exists_url() -> String {
    "http://127.0.0.1:8080/api/upload/exists".to_string()
}

/// 入队校验配置
///
/// 校验失败的文件在入队前被拒绝，不产生任务也不重试
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// 单文件大小上限（字节）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 允许的扩展名（小写，不含点）；为空表示不限制
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    /// 等待队列容量上限
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            allowed_extensions: Vec::new(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 * 1024
}
fn default_max_queue_size() -> usize {
    100
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 最大条目数
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// 条目存活时间（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_max_entries() -> usize {
    200
}
fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

/// 网络自适应配置
///
/// 质量评分阈值是经验常量，按可调配置处理而非硬编码
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationConfig {
    /// 自适应配置的新鲜度窗口（毫秒），超过则重新计算
    #[serde(default = "default_freshness_ms")]
    pub freshness_ms: u64,
    /// 速度历史窗口大小（样本数）
    #[serde(default = "default_speed_history_size")]
    pub speed_history_size: usize,
    /// 质量评分 >= 此值判定为 good（0-100）
    #[serde(default = "default_good_score")]
    pub good_score: u32,
    /// 质量评分 >= 此值判定为 fair（0-100）
    #[serde(default = "default_fair_score")]
    pub fair_score: u32,
    /// 历史速度低于此值（bytes/s）视为持续慢速，强制保守参数
    #[serde(default = "default_slow_speed_bps")]
    pub slow_speed_bps: u64,
    /// 瞬时速度高于此值（bytes/s）视为高速链路
    #[serde(default = "default_fast_speed_bps")]
    pub fast_speed_bps: u64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            freshness_ms: default_freshness_ms(),
            speed_history_size: default_speed_history_size(),
            good_score: default_good_score(),
            fair_score: default_fair_score(),
            slow_speed_bps: default_slow_speed_bps(),
            fast_speed_bps: default_fast_speed_bps(),
        }
    }
}

fn default_freshness_ms() -> u64 {
    10_000
}
fn default_speed_history_size() -> usize {
    16
}
fn default_good_score() -> u32 {
    70
}
fn default_fair_score() -> u32 {
    40
}
fn default_slow_speed_bps() -> u64 {
    128 * 1024
}
fn default_fast_speed_bps() -> u64 {
    4 * 1024 * 1024
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

fn default_log_enabled() -> bool {
    true
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_log_retention_days() -> u32 {
    7
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl EngineConfig {
    /// 从 TOML 文件加载配置，文件不存在时返回默认配置
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("配置文件不存在，使用默认配置: {:?}", path);
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;

        info!("配置加载完成: {:?}", path);
        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }

        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        info!("配置已保存: {:?}", path);
        Ok(())
    }
}
