// 引擎上下文
//
// 显式的上下文对象，在构造时注入各组件（替代模块级全局单例）。
// 每个字段有明确的单一写者：
// - config: 调度器整体替换；自适应输出不回写 config，调度器按 tick 拉取
// - cache / cancel / events / adapt: 各自内部同步，多读者共享

use crate::common::BoundedCache;
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::transport::UploadTransport;
use crate::uploader::adapt::NetworkAdaptationController;
use crate::uploader::cancel::CancelRegistry;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 引擎上下文
pub struct UploadContext {
    /// 配置（显式更新时整体替换）
    config: parking_lot::RwLock<EngineConfig>,
    /// 服务端传输
    pub transport: Arc<dyn UploadTransport>,
    /// 秒传标记 + 续传快照缓存
    pub cache: Arc<BoundedCache>,
    /// 网络自适应控制器
    pub adapt: Arc<NetworkAdaptationController>,
    /// 取消控制器
    pub cancel: Arc<CancelRegistry>,
    /// 事件总线
    pub events: Arc<EventBus>,
}

impl UploadContext {
    pub fn new(config: EngineConfig, transport: Arc<dyn UploadTransport>) -> Arc<Self> {
        let cache = Arc::new(BoundedCache::new(
            config.cache.max_entries,
            Duration::from_secs(config.cache.ttl_secs),
        ));
        let adapt = Arc::new(NetworkAdaptationController::new(
            config.upload.clone(),
            config.adaptation.clone(),
        ));

        Arc::new(Self {
            config: parking_lot::RwLock::new(config),
            transport,
            cache,
            adapt,
            cancel: Arc::new(CancelRegistry::new()),
            events: Arc::new(EventBus::new()),
        })
    }

    /// 当前配置的克隆
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// 上传配置的克隆（热路径常用）
    pub fn upload_config(&self) -> crate::config::UploadConfig {
        self.config.read().upload.clone()
    }

    /// 显式配置更新：整体替换
    pub fn update_config(&self, config: EngineConfig) {
        info!("配置整体替换");
        *self.config.write() = config;
    }
}

impl std::fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadContext")
            .field("cache_entries", &self.cache.len())
            .field("active_cancel_tasks", &self.cancel.task_count())
            .finish()
    }
}
