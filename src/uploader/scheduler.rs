// 上传调度器
//
// 顶层编排：
// - 入队校验（空文件 / 超限 / 扩展名 / 队列容量），校验失败不产生任务、不重试
// - 等待队列按优先级排序（high > normal > low），同级按文件大小升序
//   （小文件先走，尽早让吞吐可见）
// - 持续补位：活跃任务数低于 max_concurrent_files 时从队列取任务启动
//   分片传输单元，短间隔轮询等待最早完成者
// - 聚合统计：按字节加权的全局进度、全局速度、质量标签
// - 生命周期操作：全局与单文件的 暂停/恢复/取消/移除 + 手动重试失败任务
//
// 错误不越过调度器边界外抛：失败计入任务记录，整轮结束时以
// AllComplete{success, failed} / AllError 聚合呈现

use crate::context::UploadContext;
use crate::events::UploadEvent;
use crate::uploader::adapt::NetworkQuality;
use crate::uploader::engine::{ChunkTransferUnit, RunOutcome};
use crate::uploader::retry::{ResolvedRetry, RetryStrategy};
use crate::uploader::task::{FileSource, TaskOptions, TaskPriority, TaskStatus, UploadTask};
use anyhow::Result;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 调度轮询间隔（毫秒）
const POLL_INTERVAL_MS: u64 = 100;

/// 入队校验错误
///
/// 在任务产生之前被拒绝，永不重试
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("文件为空: {0}")]
    EmptyFile(String),
    #[error("文件超过大小上限: {name} ({size} > {limit} bytes)")]
    Oversized { name: String, size: u64, limit: u64 },
    #[error("不允许的扩展名: {name} (.{extension})")]
    DisallowedExtension { name: String, extension: String },
    #[error("队列已满 (容量 {0})")]
    QueueFull(usize),
}

/// 队列条目（排序键在入队时固化，避免排序时逐个锁任务）
#[derive(Debug, Clone)]
struct QueueEntry {
    task_id: String,
    priority: TaskPriority,
    file_size: u64,
}

/// 聚合统计
#[derive(Debug, Clone, Serialize)]
pub struct UploadStats {
    pub total_tasks: usize,
    pub pending: usize,
    pub active: usize,
    pub success: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub paused: usize,
    /// 按字节加权的全局进度（0-100）
    pub total_progress: u8,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// 全局瞬时速度（bytes/s）
    pub speed_bps: u64,
    pub quality: String,
}

/// 上传调度器
///
/// 所有字段 Arc 共享，Clone 后指向同一调度器实例（调度循环即以此自持）
#[derive(Clone)]
pub struct UploadScheduler {
    ctx: Arc<UploadContext>,
    /// 全部任务（task_id -> 任务），调度器独占写入映射本身
    tasks: Arc<DashMap<String, Arc<Mutex<UploadTask>>>>,
    /// 入队时解析好的重试策略
    resolved_retries: Arc<DashMap<String, ResolvedRetry>>,
    /// 等待队列
    queue: Arc<parking_lot::Mutex<Vec<QueueEntry>>>,
    /// 活跃任务集合（占位即表示在跑）
    active: Arc<DashMap<String, ()>>,
    /// 已终结任务（Success / Error / Cancelled）
    completed: Arc<parking_lot::Mutex<Vec<String>>>,
    /// 调度循环开关
    running: Arc<AtomicBool>,
    /// 本轮结束事件是否已发布
    drained: Arc<AtomicBool>,
    /// 上次发布的全局速度
    last_speed: Arc<AtomicU64>,
    /// 聚合事件节流
    throttler: Arc<crate::common::Throttler>,
    /// 可选的全局重试策略变体（未设置时按配置走 smart_retry 路径）
    retry_strategy: Arc<parking_lot::Mutex<Option<RetryStrategy>>>,
}

impl UploadScheduler {
    pub fn new(ctx: Arc<UploadContext>) -> Self {
        Self {
            ctx,
            tasks: Arc::new(DashMap::new()),
            resolved_retries: Arc::new(DashMap::new()),
            queue: Arc::new(parking_lot::Mutex::new(Vec::new())),
            active: Arc::new(DashMap::new()),
            completed: Arc::new(parking_lot::Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            drained: Arc::new(AtomicBool::new(false)),
            last_speed: Arc::new(AtomicU64::new(0)),
            throttler: Arc::new(crate::common::Throttler::default()),
            retry_strategy: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// 设置全局重试策略变体（入队时解析生效，不影响已入队任务）
    pub fn set_retry_strategy(&self, strategy: RetryStrategy) {
        *self.retry_strategy.lock() = Some(strategy);
    }

    pub fn context(&self) -> &Arc<UploadContext> {
        &self.ctx
    }

    // =====================================================
    // 入队
    // =====================================================

    /// 校验单个文件
    fn validate(&self, file: &FileSource, incoming: usize) -> Result<(), ValidationError> {
        let config = self.ctx.config();

        if file.size == 0 {
            return Err(ValidationError::EmptyFile(file.file_name.clone()));
        }
        if file.size > config.validation.max_file_size {
            return Err(ValidationError::Oversized {
                name: file.file_name.clone(),
                size: file.size,
                limit: config.validation.max_file_size,
            });
        }
        if !config.validation.allowed_extensions.is_empty() {
            let extension = file.extension();
            if !config.validation.allowed_extensions.contains(&extension) {
                return Err(ValidationError::DisallowedExtension {
                    name: file.file_name.clone(),
                    extension,
                });
            }
        }

        let queued = self.queue.lock().len();
        if queued + incoming >= config.validation.max_queue_size {
            return Err(ValidationError::QueueFull(config.validation.max_queue_size));
        }

        Ok(())
    }

    /// 批量入队
    ///
    /// 全部文件先通过校验再产生任务（不产生半截状态）；
    /// 重试策略在此处一次性解析
    pub fn add_files(
        &self,
        files: Vec<FileSource>,
        options: TaskOptions,
    ) -> Result<Vec<String>, ValidationError> {
        for (position, file) in files.iter().enumerate() {
            self.validate(file, position)?;
        }

        let config = self.ctx.upload_config();
        let strategy = self.retry_strategy.lock().clone();
        let mut task_ids = Vec::with_capacity(files.len());

        for file in files {
            let task = UploadTask::new(file, options.clone());
            let task_id = task.id.clone();

            let resolved = match &strategy {
                Some(strategy) => {
                    ResolvedRetry::resolve(strategy, &config, task.options.max_retries)
                }
                None if config.smart_retry => {
                    ResolvedRetry::from_config(&config, task.options.max_retries)
                }
                None => ResolvedRetry::resolve(
                    &RetryStrategy::Simple(task.options.max_retries.unwrap_or(config.max_retries)),
                    &config,
                    task.options.max_retries,
                ),
            };

            info!(
                "任务入队: id={}, file={}, size={}, priority={:?}",
                task_id, task.file.file_name, task.file.size, task.priority
            );

            self.ctx.cancel.register_task(&task_id);
            self.resolved_retries.insert(task_id.clone(), resolved);
            self.queue.lock().push(QueueEntry {
                task_id: task_id.clone(),
                priority: task.priority,
                file_size: task.file.size,
            });
            self.tasks
                .insert(task_id.clone(), Arc::new(Mutex::new(task)));
            task_ids.push(task_id);
        }

        self.drained.store(false, Ordering::SeqCst);
        self.emit_queue_changed();
        Ok(task_ids)
    }

    // =====================================================
    // 调度循环
    // =====================================================

    /// 启动调度循环（幂等）
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("调度循环已在运行，忽略重复 start");
            return;
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("🚀 上传调度循环已启动");
            while scheduler.running.load(Ordering::SeqCst) {
                scheduler.tick().await;
                tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            info!("上传调度循环已停止");
        });
    }

    /// 停止调度循环（不取消在跑任务）
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// 单轮调度
    async fn tick(&self) {
        let config = self.ctx.upload_config();

        // 文件级并发上限：自适应开启时取控制器输出
        let max_files = if config.enable_adaptation {
            self.ctx.adapt.adaptive_config().max_concurrent_files
        } else {
            config.max_concurrent_files
        };

        // 补位
        while self.active.len() < max_files {
            match self.pop_next_queued() {
                Some(task_id) => self.launch(task_id),
                None => break,
            }
        }

        self.publish_aggregates().await;
        self.detect_drain().await;
    }

    /// 取出排序最优的等待任务（优先级降序，同级按大小升序）
    fn pop_next_queued(&self) -> Option<String> {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return None;
        }

        let best = queue
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| (entry.priority, entry.file_size))
            .map(|(index, _)| index)?;
        Some(queue.swap_remove(best).task_id)
    }

    /// 启动一个任务的分片传输单元
    fn launch(&self, task_id: String) {
        let task = match self.tasks.get(&task_id) {
            Some(entry) => entry.value().clone(),
            None => {
                warn!("队列中的任务不存在，跳过: {}", task_id);
                return;
            }
        };

        let retry = self
            .resolved_retries
            .get(&task_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| ResolvedRetry::from_config(&self.ctx.upload_config(), None));

        self.active.insert(task_id.clone(), ());
        self.emit_queue_changed();

        let scheduler = self.clone();
        tokio::spawn(async move {
            let unit = ChunkTransferUnit::new(scheduler.ctx.clone(), retry);
            let outcome = unit.run(task.clone()).await;

            // 先记账再退出活跃集合，避免聚合判定窗口内漏计
            match outcome {
                Ok(RunOutcome::Completed) | Err(_) => {
                    scheduler.finish_task(&task_id);
                }
                Ok(RunOutcome::Cancelled) => {
                    // 注册表直接触发的取消：任务可能还停在 Uploading
                    {
                        let mut t = task.lock().await;
                        if t.status == TaskStatus::Uploading {
                            t.mark_cancelled();
                            scheduler
                                .ctx
                                .events
                                .emit(UploadEvent::TaskCancelled { task: t.snapshot() });
                        }
                    }
                    scheduler.finish_task(&task_id);
                }
                Ok(RunOutcome::Paused) => {
                    // 暂停发生在引擎标记 Uploading 之后：补上 Paused 标记
                    let mut t = task.lock().await;
                    if t.status == TaskStatus::Uploading {
                        t.mark_paused();
                    }
                    debug!("任务暂停，等待恢复: {}", task_id);
                }
            }

            scheduler.active.remove(&task_id);
            scheduler.emit_queue_changed();
        });
    }

    /// 任务终结：移入 completed 列表
    fn finish_task(&self, task_id: &str) {
        let mut completed = self.completed.lock();
        if !completed.iter().any(|existing| existing == task_id) {
            completed.push(task_id.to_string());
        }
    }

    /// 聚合进度/速度发布
    async fn publish_aggregates(&self) {
        let mut total_bytes = 0u64;
        let mut uploaded_bytes = 0u64;
        let mut speed = 0u64;

        // 先克隆引用再逐个加锁，不在持有分片锁时 await
        let task_refs: Vec<Arc<Mutex<UploadTask>>> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for task in task_refs {
            let t = task.lock().await;
            total_bytes += t.file.size;
            uploaded_bytes += match t.status {
                TaskStatus::Success => t.file.size,
                _ => t.uploaded_bytes(),
            };
            if t.status == TaskStatus::Uploading {
                speed += t.speed;
            }
        }

        if total_bytes == 0 {
            return;
        }

        if self.throttler.should_emit() {
            let progress = ((uploaded_bytes as f64 / total_bytes as f64) * 100.0).round() as u8;
            self.ctx.events.emit(UploadEvent::TotalProgress {
                progress: progress.min(100),
                uploaded_bytes,
                total_bytes,
            });

            // 瞬时速度变化时重算质量标签
            let previous = self.last_speed.swap(speed, Ordering::SeqCst);
            if speed != previous {
                let quality = self.ctx.adapt.quality_from_speed(speed);
                self.ctx.events.emit(UploadEvent::SpeedChanged {
                    speed,
                    quality: quality.as_str().to_string(),
                });
            }
        }
    }

    /// 本轮任务全部结束的判定与聚合事件
    async fn detect_drain(&self) {
        if self.drained.load(Ordering::SeqCst) {
            return;
        }
        if !self.queue.lock().is_empty() || !self.active.is_empty() {
            return;
        }
        let completed_ids = self.completed.lock().clone();
        if completed_ids.is_empty() {
            return;
        }

        let mut success = 0usize;
        let mut failed = 0usize;
        for task_id in &completed_ids {
            let task = match self.tasks.get(task_id) {
                Some(entry) => entry.value().clone(),
                None => continue,
            };
            let status = task.lock().await.status;
            match status {
                TaskStatus::Success => success += 1,
                TaskStatus::Error => failed += 1,
                _ => {}
            }
        }

        if self.drained.swap(true, Ordering::SeqCst) {
            return;
        }

        // 部分失败不外抛错误，以计数呈现
        if success == 0 && failed > 0 {
            info!("本轮任务全部失败: failed={}", failed);
            self.ctx.events.emit(UploadEvent::AllError { failed });
        } else {
            info!("本轮任务结束: success={}, failed={}", success, failed);
            self.ctx
                .events
                .emit(UploadEvent::AllComplete { success, failed });
        }
    }

    fn emit_queue_changed(&self) {
        self.ctx.events.emit(UploadEvent::QueueChanged {
            pending: self.queue.lock().len(),
            active: self.active.len(),
            completed: self.completed.lock().len(),
        });
    }

    // =====================================================
    // 单文件生命周期操作
    // =====================================================

    /// 暂停任务（上传中或排队中均可）
    pub async fn pause(&self, task_id: &str) -> bool {
        let task = match self.tasks.get(task_id) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };

        {
            let mut t = task.lock().await;
            if !matches!(t.status, TaskStatus::Uploading | TaskStatus::Pending) {
                return false;
            }
            t.mark_paused();
            self.ctx.cancel.pause(task_id);
            self.ctx
                .events
                .emit(UploadEvent::TaskPaused { task: t.snapshot() });
        }

        // 排队中的任务直接摘出队列
        self.queue.lock().retain(|entry| entry.task_id != task_id);
        self.emit_queue_changed();
        true
    }

    /// 恢复任务：Paused -> Pending 重新入队，已 Success 的分片跳过
    pub async fn resume(&self, task_id: &str) -> bool {
        let task = match self.tasks.get(task_id) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };

        let (priority, file_size) = {
            let mut t = task.lock().await;
            if t.status != TaskStatus::Paused {
                return false;
            }
            t.mark_resumed();
            self.ctx
                .events
                .emit(UploadEvent::TaskResumed { task: t.snapshot() });
            (t.priority, t.file.size)
        };

        self.ctx.cancel.resume(task_id);
        // 令牌重新注册：暂停期间可能被取消过的旧令牌不复用
        self.ctx.cancel.register_task(task_id);

        self.queue.lock().push(QueueEntry {
            task_id: task_id.to_string(),
            priority,
            file_size,
        });
        self.drained.store(false, Ordering::SeqCst);
        self.emit_queue_changed();
        true
    }

    /// 取消任务（任何非终态均可）
    pub async fn cancel(&self, task_id: &str) -> bool {
        let task = match self.tasks.get(task_id) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };

        let was_queued = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.retain(|entry| entry.task_id != task_id);
            queue.len() != before
        };

        {
            let mut t = task.lock().await;
            if t.status.is_terminal() {
                return false;
            }
            t.mark_cancelled();
            self.ctx.cancel.cancel_task(task_id);
            self.ctx
                .events
                .emit(UploadEvent::TaskCancelled { task: t.snapshot() });
        }

        // 在跑的任务由传输单元自行退场；排队/暂停的任务在此终结
        if was_queued || !self.active.contains_key(task_id) {
            self.finish_task(task_id);
        }
        self.emit_queue_changed();
        true
    }

    /// 移除任务：先取消，再清理全部记录与续传快照
    pub async fn remove(&self, task_id: &str) -> bool {
        let existed = self.tasks.contains_key(task_id);
        if !existed {
            return false;
        }

        self.cancel(task_id).await;

        self.tasks.remove(task_id);
        self.resolved_retries.remove(task_id);
        self.completed.lock().retain(|existing| existing != task_id);
        self.ctx.cancel.remove_task(task_id);
        self.ctx.cache.remove(&format!("resume:{}", task_id));
        self.emit_queue_changed();
        true
    }

    // =====================================================
    // 全局操作
    // =====================================================

    pub async fn pause_all(&self) {
        let task_ids: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        join_all(task_ids.iter().map(|task_id| self.pause(task_id))).await;
    }

    pub async fn resume_all(&self) {
        let task_ids: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        join_all(task_ids.iter().map(|task_id| self.resume(task_id))).await;
    }

    pub async fn cancel_all(&self) {
        let task_ids: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        join_all(task_ids.iter().map(|task_id| self.cancel(task_id))).await;
    }

    /// 手动重试失败任务：只重置非 Success 分片，抬高优先级重新入队
    pub async fn retry_failed(&self) -> usize {
        let mut retried = 0usize;
        let task_ids: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();

        for task_id in task_ids {
            let task = match self.tasks.get(&task_id) {
                Some(entry) => entry.value().clone(),
                None => continue,
            };

            let file_size = {
                let mut t = task.lock().await;
                if t.status != TaskStatus::Error {
                    continue;
                }
                t.prepare_retry(TaskPriority::High);
                t.file.size
            };

            self.ctx.cancel.register_task(&task_id);
            self.completed.lock().retain(|existing| existing != &task_id);
            self.queue.lock().push(QueueEntry {
                task_id: task_id.clone(),
                priority: TaskPriority::High,
                file_size,
            });
            retried += 1;
            info!("失败任务重新入队（高优先级）: {}", task_id);
        }

        if retried > 0 {
            self.drained.store(false, Ordering::SeqCst);
            self.emit_queue_changed();
        }
        retried
    }

    // =====================================================
    // 查询
    // =====================================================

    /// 任务快照
    pub async fn task_snapshot(&self, task_id: &str) -> Option<crate::events::TaskSnapshot> {
        let task = self.tasks.get(task_id)?.value().clone();
        let t = task.lock().await;
        Some(t.snapshot())
    }

    /// 聚合统计
    pub async fn stats(&self) -> UploadStats {
        let mut stats = UploadStats {
            total_tasks: 0,
            pending: 0,
            active: self.active.len(),
            success: 0,
            failed: 0,
            cancelled: 0,
            paused: 0,
            total_progress: 0,
            uploaded_bytes: 0,
            total_bytes: 0,
            speed_bps: 0,
            quality: NetworkQuality::Good.as_str().to_string(),
        };

        let task_refs: Vec<Arc<Mutex<UploadTask>>> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for task in task_refs {
            let t = task.lock().await;
            stats.total_tasks += 1;
            stats.total_bytes += t.file.size;
            stats.uploaded_bytes += match t.status {
                TaskStatus::Success => t.file.size,
                _ => t.uploaded_bytes(),
            };
            match t.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Success => stats.success += 1,
                TaskStatus::Error => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::Paused => stats.paused += 1,
                TaskStatus::Uploading => stats.speed_bps += t.speed,
            }
        }

        if stats.total_bytes > 0 {
            stats.total_progress =
                (((stats.uploaded_bytes as f64) / (stats.total_bytes as f64)) * 100.0).round()
                    as u8;
        }
        stats.quality = self
            .ctx
            .adapt
            .quality_from_speed(stats.speed_bps)
            .as_str()
            .to_string();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::transport::{
        ChunkUploadRequest, ChunkUploadResponse, ExistsRequest, ExistsResponse, MergeRequest,
        MergeResponse, StoredFile, UploadError, UploadTransport,
    };
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use tempfile::{NamedTempFile, TempDir};

    /// 简单内存传输：文件名含 "bad" 的分片返回 500
    struct MemoryTransport {
        chunk_calls: AtomicUsize,
        delay: Duration,
    }

    impl MemoryTransport {
        fn new() -> Self {
            Self {
                chunk_calls: AtomicUsize::new(0),
                delay: Duration::from_millis(2),
            }
        }
    }

    #[async_trait]
    impl UploadTransport for MemoryTransport {
        async fn upload_chunk(
            &self,
            request: ChunkUploadRequest,
        ) -> Result<ChunkUploadResponse, UploadError> {
            self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            if request.file_name.contains("bad") {
                return Err(UploadError::Status {
                    status: 500,
                    message: "injected".into(),
                });
            }

            Ok(ChunkUploadResponse {
                success: true,
                etag: format!("etag-{}", request.index),
                message: String::new(),
            })
        }

        async fn merge_chunks(&self, request: MergeRequest) -> Result<MergeResponse, UploadError> {
            Ok(MergeResponse {
                success: true,
                file: Some(StoredFile {
                    url: format!("https://cdn.example.com/{}", request.file_name),
                    thumbnail: None,
                    doc_id: None,
                }),
                message: String::new(),
            })
        }

        async fn check_exists(
            &self,
            _request: ExistsRequest,
        ) -> Result<ExistsResponse, UploadError> {
            Ok(ExistsResponse {
                exists: false,
                file: None,
            })
        }
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.upload.chunk_size = 1024;
        config.upload.min_chunk_size = 256;
        config.upload.max_chunk_size = 4096;
        config.upload.chunk_stagger_ms = 0;
        config.upload.retry_delay_ms = 1;
        config.upload.max_retry_delay_ms = 3;
        config.upload.max_retries = 1;
        config.upload.enable_adaptation = false;
        config.upload.enable_dedup = false;
        config
    }

    fn scheduler_with(config: EngineConfig) -> (UploadScheduler, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let ctx = UploadContext::new(config, transport.clone());
        (UploadScheduler::new(ctx), transport)
    }

    fn named_file(dir: &TempDir, name: &str, size: usize) -> FileSource {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0x42u8; size]).unwrap();
        file.flush().unwrap();
        FileSource::from_path(path).unwrap()
    }

    fn quick_temp(size: usize) -> (NamedTempFile, FileSource) {
        let mut temp = NamedTempFile::new().unwrap();
        if size > 0 {
            temp.write_all(&vec![0u8; size]).unwrap();
            temp.flush().unwrap();
        }
        let source = FileSource::from_path(temp.path()).unwrap();
        (temp, source)
    }

    /// 轮询等待任务到达指定状态
    async fn wait_for_status(
        scheduler: &UploadScheduler,
        task_id: &str,
        status: &str,
        timeout_ms: u64,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if let Some(snapshot) = scheduler.task_snapshot(task_id).await {
                if snapshot.status == status {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_validation_empty_file_rejected() {
        let (scheduler, _) = scheduler_with(test_config());
        let (_temp, source) = quick_temp(0);

        let result = scheduler.add_files(vec![source], TaskOptions::default());
        assert!(matches!(result, Err(ValidationError::EmptyFile(_))));
        assert_eq!(scheduler.stats().await.total_tasks, 0);
    }

    #[tokio::test]
    async fn test_validation_oversized_rejected() {
        let mut config = test_config();
        config.validation.max_file_size = 100;
        let (scheduler, _) = scheduler_with(config);
        let (_temp, source) = quick_temp(200);

        let result = scheduler.add_files(vec![source], TaskOptions::default());
        assert!(matches!(result, Err(ValidationError::Oversized { .. })));
    }

    #[tokio::test]
    async fn test_validation_extension_rejected() {
        let mut config = test_config();
        config.validation.allowed_extensions = vec!["png".into(), "jpg".into()];
        let (scheduler, _) = scheduler_with(config);

        let dir = TempDir::new().unwrap();
        let source = named_file(&dir, "archive.zip", 64);

        let result = scheduler.add_files(vec![source], TaskOptions::default());
        assert!(matches!(
            result,
            Err(ValidationError::DisallowedExtension { .. })
        ));
    }

    #[tokio::test]
    async fn test_validation_queue_capacity() {
        let mut config = test_config();
        config.validation.max_queue_size = 2;
        let (scheduler, _) = scheduler_with(config);
        let dir = TempDir::new().unwrap();

        let files = vec![
            named_file(&dir, "a.bin", 64),
            named_file(&dir, "b.bin", 64),
            named_file(&dir, "c.bin", 64),
        ];
        let result = scheduler.add_files(files, TaskOptions::default());
        assert!(matches!(result, Err(ValidationError::QueueFull(_))));
    }

    #[tokio::test]
    async fn test_queue_ordering_priority_then_size() {
        let (scheduler, _) = scheduler_with(test_config());
        let dir = TempDir::new().unwrap();

        let low_small = scheduler
            .add_files(
                vec![named_file(&dir, "low.bin", 100)],
                TaskOptions {
                    priority: TaskPriority::Low,
                    ..Default::default()
                },
            )
            .unwrap()[0]
            .clone();
        let normal_big = scheduler
            .add_files(
                vec![named_file(&dir, "normal-big.bin", 5000)],
                TaskOptions::default(),
            )
            .unwrap()[0]
            .clone();
        let normal_small = scheduler
            .add_files(
                vec![named_file(&dir, "normal-small.bin", 100)],
                TaskOptions::default(),
            )
            .unwrap()[0]
            .clone();
        let high = scheduler
            .add_files(
                vec![named_file(&dir, "high.bin", 9000)],
                TaskOptions {
                    priority: TaskPriority::High,
                    ..Default::default()
                },
            )
            .unwrap()[0]
            .clone();

        // high 最先，normal 中小文件先于大文件，low 最后
        assert_eq!(scheduler.pop_next_queued(), Some(high));
        assert_eq!(scheduler.pop_next_queued(), Some(normal_small));
        assert_eq!(scheduler.pop_next_queued(), Some(normal_big));
        assert_eq!(scheduler.pop_next_queued(), Some(low_small));
        assert_eq!(scheduler.pop_next_queued(), None);
    }

    #[tokio::test]
    async fn test_end_to_end_success_and_all_complete() {
        let (scheduler, _transport) = scheduler_with(test_config());
        let dir = TempDir::new().unwrap();

        let all_complete = Arc::new(AtomicUsize::new(0));
        let all_complete_clone = all_complete.clone();
        scheduler.context().events.subscribe(move |event| {
            if matches!(event, UploadEvent::AllComplete { .. }) {
                all_complete_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let task_ids = scheduler
            .add_files(
                vec![
                    named_file(&dir, "one.bin", 2500),
                    named_file(&dir, "two.bin", 1200),
                ],
                TaskOptions::default(),
            )
            .unwrap();
        scheduler.start();

        for task_id in &task_ids {
            assert!(
                wait_for_status(&scheduler, task_id, "success", 5000).await,
                "任务未在期限内成功"
            );
        }

        // 聚合事件最终发布
        let deadline = tokio::time::Instant::now() + Duration::from_millis(3000);
        while all_complete.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(all_complete.load(Ordering::SeqCst), 1);

        let stats = scheduler.stats().await;
        assert_eq!(stats.success, 2);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.total_progress, 100);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_partial_failure_aggregates_not_throws() {
        let (scheduler, _) = scheduler_with(test_config());
        let dir = TempDir::new().unwrap();

        let task_ids = scheduler
            .add_files(
                vec![
                    named_file(&dir, "good.bin", 1500),
                    named_file(&dir, "bad.bin", 1500),
                ],
                TaskOptions::default(),
            )
            .unwrap();
        scheduler.start();

        assert!(wait_for_status(&scheduler, &task_ids[0], "success", 5000).await);
        assert!(wait_for_status(&scheduler, &task_ids[1], "error", 5000).await);

        let stats = scheduler.stats().await;
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failed, 1);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_retry_failed_requeues_at_high_priority() {
        let (scheduler, _) = scheduler_with(test_config());
        let dir = TempDir::new().unwrap();

        let task_ids = scheduler
            .add_files(
                vec![named_file(&dir, "bad.bin", 1500)],
                TaskOptions::default(),
            )
            .unwrap();
        scheduler.start();
        assert!(wait_for_status(&scheduler, &task_ids[0], "error", 5000).await);
        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let retried = scheduler.retry_failed().await;
        assert_eq!(retried, 1);

        let task = scheduler.tasks.get(&task_ids[0]).unwrap().value().clone();
        let t = task.lock().await;
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.priority, TaskPriority::High);
        assert_eq!(t.retry_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_queued_task() {
        let (scheduler, transport) = scheduler_with(test_config());
        let dir = TempDir::new().unwrap();

        // 不启动调度循环，任务停留在队列
        let task_ids = scheduler
            .add_files(
                vec![named_file(&dir, "idle.bin", 1500)],
                TaskOptions::default(),
            )
            .unwrap();

        assert!(scheduler.cancel(&task_ids[0]).await);
        assert!(wait_for_status(&scheduler, &task_ids[0], "cancelled", 1000).await);
        // 取消后不可重复取消
        assert!(!scheduler.cancel(&task_ids[0]).await);
        // 未发出任何分片请求
        assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 0);

        let stats = scheduler.stats().await;
        assert_eq!(stats.cancelled, 1);
    }

    #[tokio::test]
    async fn test_pause_then_resume_queued_task() {
        let (scheduler, _) = scheduler_with(test_config());
        let dir = TempDir::new().unwrap();

        let task_ids = scheduler
            .add_files(
                vec![named_file(&dir, "pauseme.bin", 1500)],
                TaskOptions::default(),
            )
            .unwrap();

        assert!(scheduler.pause(&task_ids[0]).await);
        assert!(wait_for_status(&scheduler, &task_ids[0], "paused", 1000).await);

        assert!(scheduler.resume(&task_ids[0]).await);
        assert!(wait_for_status(&scheduler, &task_ids[0], "pending", 1000).await);

        // 恢复后可正常跑完
        scheduler.start();
        assert!(wait_for_status(&scheduler, &task_ids[0], "success", 5000).await);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_cancel_all_terminates_queued_tasks() {
        let (scheduler, _) = scheduler_with(test_config());
        let dir = TempDir::new().unwrap();

        scheduler
            .add_files(
                vec![
                    named_file(&dir, "x.bin", 1500),
                    named_file(&dir, "y.bin", 1500),
                ],
                TaskOptions::default(),
            )
            .unwrap();

        scheduler.cancel_all().await;

        let stats = scheduler.stats().await;
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_remove_cleans_records() {
        let (scheduler, _) = scheduler_with(test_config());
        let dir = TempDir::new().unwrap();

        let task_ids = scheduler
            .add_files(
                vec![named_file(&dir, "remove.bin", 1500)],
                TaskOptions::default(),
            )
            .unwrap();

        assert!(scheduler.remove(&task_ids[0]).await);
        assert!(scheduler.task_snapshot(&task_ids[0]).await.is_none());
        assert!(!scheduler.remove(&task_ids[0]).await);
        assert_eq!(scheduler.stats().await.total_tasks, 0);
    }
}
