//! 生命周期事件
//!
//! 引擎对外的回调面。调度器边界上的观察者模式：
//! 引擎内部不依赖任何 UI 反应式系统，外部通过 subscribe 订阅事件；
//! 每个事件携带任务/分片的快照，从不暴露可变引用

use serde::{Deserialize, Serialize};

/// 任务快照（事件载荷，非活动引用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub status: String,
    /// 0-100；分片阶段映射到 0-90，合并阶段映射到 90-100
    pub progress: u8,
    pub uploaded_chunks: usize,
    pub total_chunks: usize,
    /// bytes/s
    pub speed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 分片快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    pub task_id: String,
    pub index: usize,
    pub size: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务开始
    TaskStarted { task: TaskSnapshot },
    /// 任务进度更新（节流后发布）
    TaskProgress { task: TaskSnapshot },
    /// 任务成功
    TaskSuccess {
        task: TaskSnapshot,
        /// 是否为秒传命中
        deduplicated: bool,
    },
    /// 任务失败（取消不会走此事件）
    TaskError { task: TaskSnapshot, error: String },
    /// 任务暂停
    TaskPaused { task: TaskSnapshot },
    /// 任务恢复
    TaskResumed { task: TaskSnapshot },
    /// 任务取消
    TaskCancelled { task: TaskSnapshot },
    /// 分片上传成功
    ChunkSuccess { chunk: ChunkSnapshot },
    /// 分片终态失败
    ChunkError { chunk: ChunkSnapshot, error: String },
    /// 全局进度（按字节加权）
    TotalProgress { progress: u8, uploaded_bytes: u64, total_bytes: u64 },
    /// 全局速度变化
    SpeedChanged { speed: u64, quality: String },
    /// 队列变化（入队/出队/移除）
    QueueChanged { pending: usize, active: usize, completed: usize },
    /// 本轮任务全部结束（部分失败时不抛错，以计数呈现）
    AllComplete { success: usize, failed: usize },
    /// 本轮任务全部失败
    AllError { failed: usize },
}

type Listener = std::sync::Arc<dyn Fn(&UploadEvent) + Send + Sync>;

/// 事件总线
///
/// subscribe 注册监听器并返回 id，unsubscribe 注销；
/// emit 同步逐个调用监听器（监听器应当轻量，重活自行转投异步）
#[derive(Default)]
pub struct EventBus {
    listeners: parking_lot::RwLock<Vec<(u64, Listener)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册监听器，返回用于注销的 id
    pub fn subscribe<F>(&self, listener: F) -> u64
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.listeners
            .write()
            .push((id, std::sync::Arc::new(listener)));
        id
    }

    /// 注销监听器
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// 发布事件
    pub fn emit(&self, event: UploadEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        if listeners.is_empty() {
            return;
        }

        for listener in listeners {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
