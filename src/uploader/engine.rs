// 分片传输单元
//
// 单个文件的完整上传流程（对已 Success 的分片幂等）：
// 1. 秒传检查：缓存标记 -> 存在性接口，命中直接成功
// 2. 分片划分：按实测吞吐推导分片大小；恢复场景跳过划分、从快照回填
// 3. 分片上传：并发闸门限流 + 错峰发车 + 分类重试，失败即向任务传播
//    （不等待兄弟分片，已发车的分片自然跑完或被取消）
// 4. 停止检查：发车前与合并前检查暂停/取消，必要时持久化续传快照
// 5. 合并：携带按序确认令牌，进度走 90 -> 100
//
// 取消在任何一步发生时静默中止，不标记 Error、不走错误回调

use crate::common::{ConcurrencyGate, SlotPool, SpeedEstimator, Throttler};
use crate::context::UploadContext;
use crate::events::{ChunkSnapshot as ChunkEventSnapshot, UploadEvent};
use crate::transport::{ChunkUploadRequest, MergeRequest, UploadError};
use crate::uploader::chunk::{optimal_chunk_size, ChunkManager, ChunkSnapshot, ChunkStatus};
use crate::uploader::fingerprint::{DedupChecker, DedupOutcome, FileFingerprint};
use crate::uploader::retry::{ResolvedRetry, RetryStrategy};
use crate::uploader::task::{FileSource, UploadTask};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 一次 run 的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 上传并合并完成（或秒传命中）
    Completed,
    /// 被暂停：停止发车，已持久化续传快照
    Paused,
    /// 被取消：静默中止
    Cancelled,
}

/// 续传快照的缓存键
fn resume_key(task_id: &str) -> String {
    format!("resume:{}", task_id)
}

/// 分片传输单元
pub struct ChunkTransferUnit {
    ctx: Arc<UploadContext>,
    /// 入队时解析好的重试策略
    retry: ResolvedRetry,
}

/// 分片上传环境（并发 worker 共享的只读快照与句柄）
#[derive(Clone)]
struct ChunkUploadEnv {
    ctx: Arc<UploadContext>,
    task: Arc<Mutex<UploadTask>>,
    manager: Arc<Mutex<ChunkManager>>,
    retry: ResolvedRetry,
    file_path: PathBuf,
    file_id: String,
    file_name: String,
    file_size: u64,
    total_chunks: usize,
    custom_fields: HashMap<String, String>,
    timeout: Duration,
    stagger: Duration,
    task_speed: Arc<SpeedEstimator>,
    throttler: Arc<Throttler>,
}

impl ChunkTransferUnit {
    pub fn new(ctx: Arc<UploadContext>, retry: ResolvedRetry) -> Self {
        Self { ctx, retry }
    }

    /// 用默认策略构造（smart_retry 路径）
    pub fn with_default_retry(ctx: Arc<UploadContext>) -> Self {
        let config = ctx.upload_config();
        let retry = if config.smart_retry {
            ResolvedRetry::from_config(&config, None)
        } else {
            ResolvedRetry::resolve(&RetryStrategy::Simple(config.max_retries), &config, None)
        };
        Self::new(ctx, retry)
    }

    /// 执行一个任务的上传
    ///
    /// 对已 Success 的分片幂等：恢复的任务只会重新派发剩余分片
    pub async fn run(&self, task: Arc<Mutex<UploadTask>>) -> Result<RunOutcome> {
        let (task_id, file, options_chunk_size, custom_fields) = {
            let t = task.lock().await;
            (
                t.id.clone(),
                t.file.clone(),
                t.options.chunk_size,
                t.options.custom_fields.clone(),
            )
        };

        let config = self.ctx.upload_config();
        let token = self
            .ctx
            .cancel
            .task_token(&task_id)
            .unwrap_or_else(|| self.ctx.cancel.register_task(&task_id));

        info!(
            "开始上传任务: id={}, file={}, size={} bytes",
            task_id, file.file_name, file.size
        );

        {
            let mut t = task.lock().await;
            t.mark_uploading();
            self.ctx
                .events
                .emit(UploadEvent::TaskStarted { task: t.snapshot() });
        }

        // ========== 1. 秒传检查 ==========
        let mut fingerprint: Option<FileFingerprint> = None;
        let checker = DedupChecker::new(
            self.ctx.transport.clone(),
            self.ctx.cache.clone(),
            config.enable_cache,
        );

        if config.enable_dedup {
            match checker.check(&file, &token).await {
                Ok(DedupOutcome::Hit {
                    fingerprint: hit_fingerprint,
                    stored,
                }) => {
                    checker.write_marker(&hit_fingerprint);
                    let mut t = task.lock().await;
                    t.mark_success(stored, true);
                    self.ctx.events.emit(UploadEvent::TaskSuccess {
                        task: t.snapshot(),
                        deduplicated: true,
                    });
                    info!("秒传完成，零分片请求: id={}", task_id);
                    return Ok(RunOutcome::Completed);
                }
                Ok(DedupOutcome::Miss {
                    fingerprint: miss_fingerprint,
                }) => fingerprint = Some(miss_fingerprint),
                Err(check_error) => {
                    if token.is_cancelled() {
                        return Ok(RunOutcome::Cancelled);
                    }
                    // 秒传检查失败不致命
                    warn!("秒传检查失败，回落普通上传: {}", check_error);
                }
            }
        }

        let file_id = fingerprint
            .as_ref()
            .map(|fp| fp.key())
            .unwrap_or_else(|| format!("{}-{}-{}", file.file_name, file.size, file.modified_ms));

        // ========== 2. 分片划分（恢复时跳过） ==========
        let adaptive = config
            .enable_adaptation
            .then(|| self.ctx.adapt.adaptive_config());

        let manager = {
            let t = task.lock().await;
            if t.chunks.is_empty() {
                let avg_speed = config
                    .enable_adaptation
                    .then(|| self.ctx.adapt.average_speed_bps())
                    .flatten();
                let chunk_size = options_chunk_size
                    .map(|size| size.clamp(config.min_chunk_size, config.max_chunk_size))
                    .unwrap_or_else(|| optimal_chunk_size(file.size, avg_speed, &config));
                drop(t);

                let mut manager = ChunkManager::new(file.size, chunk_size);

                // 恢复：缓存中的续传快照回填已完成分片
                if config.enable_resume && config.enable_cache {
                    if let Some(value) = self.ctx.cache.get(&resume_key(&task_id)) {
                        if let Ok(snapshot) = serde_json::from_value::<ChunkSnapshot>(value) {
                            manager.restore(&snapshot);
                        }
                    }
                }
                manager
            } else {
                // 任务已有分片（暂停后恢复），跳过划分；
                // 残留的 Uploading/Retrying/Error 复位为 Pending，Success 幂等跳过
                let chunk_size = if t.chunks.len() > 1 {
                    t.chunks[0].size()
                } else {
                    file.size
                };
                let mut chunks = t.chunks.clone();
                for chunk in &mut chunks {
                    chunk.reset_if_not_success();
                }
                ChunkManager::from_chunks(chunks, file.size, chunk_size)
            }
        };
        let manager = Arc::new(Mutex::new(manager));

        let (total_chunks, pending_before) = {
            let mut t = task.lock().await;
            let m = manager.lock().await;
            t.chunks = m.chunks().to_vec();
            t.refresh_uploaded_chunks();
            (m.chunk_count(), m.chunk_count() - m.completed_count())
        };
        debug!(
            "分片就绪: id={}, total={}, 待传={}",
            task_id, total_chunks, pending_before
        );

        // ========== 3. 分片上传 ==========
        let max_chunks = adaptive
            .map(|a| a.max_concurrent_chunks)
            .unwrap_or(config.max_concurrent_chunks);
        let timeout_secs = adaptive
            .map(|a| a.timeout_secs)
            .unwrap_or(config.chunk_timeout_secs);

        let env = ChunkUploadEnv {
            ctx: self.ctx.clone(),
            task: task.clone(),
            manager: manager.clone(),
            retry: self.retry.clone(),
            file_path: file.path.clone(),
            file_id: file_id.clone(),
            file_name: file.file_name.clone(),
            file_size: file.size,
            total_chunks,
            custom_fields,
            timeout: Duration::from_secs(timeout_secs),
            stagger: Duration::from_millis(config.chunk_stagger_ms),
            task_speed: Arc::new(SpeedEstimator::default()),
            throttler: Arc::new(Throttler::default()),
        };

        let outcome = self
            .upload_chunks(&task_id, &file, env, &token, max_chunks)
            .await;

        // 停止（暂停/取消）时持久化续传快照
        match outcome {
            Ok(RunOutcome::Paused) | Ok(RunOutcome::Cancelled) => {
                self.sync_chunks_into_task(&task, &manager).await;
                if config.enable_resume && config.enable_cache {
                    let snapshot = manager.lock().await.snapshot();
                    if let Ok(value) = serde_json::to_value(&snapshot) {
                        self.ctx.cache.put(&resume_key(&task_id), value);
                        debug!("续传快照已写入缓存: id={}", task_id);
                    }
                }
                return outcome;
            }
            Err(_) => {
                self.sync_chunks_into_task(&task, &manager).await;
                return outcome;
            }
            Ok(RunOutcome::Completed) => {}
        }

        // ========== 4. 合并前停止检查 ==========
        if token.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        if self.ctx.cancel.is_paused(&task_id) {
            self.sync_chunks_into_task(&task, &manager).await;
            if config.enable_resume && config.enable_cache {
                let snapshot = manager.lock().await.snapshot();
                if let Ok(value) = serde_json::to_value(&snapshot) {
                    self.ctx.cache.put(&resume_key(&task_id), value);
                }
            }
            return Ok(RunOutcome::Paused);
        }

        // ========== 5. 合并 ==========
        self.merge_chunks(&task_id, &file, &task, &manager, &token, &config, fingerprint.as_ref(), &checker, &file_id)
            .await
    }

    /// 把管理器中的分片状态回写任务（快照/恢复一致性）
    async fn sync_chunks_into_task(
        &self,
        task: &Arc<Mutex<UploadTask>>,
        manager: &Arc<Mutex<ChunkManager>>,
    ) {
        let mut t = task.lock().await;
        let m = manager.lock().await;
        t.chunks = m.chunks().to_vec();
        t.refresh_uploaded_chunks();
    }

    /// 并发分片上传主循环
    async fn upload_chunks(
        &self,
        task_id: &str,
        file: &FileSource,
        env: ChunkUploadEnv,
        token: &CancellationToken,
        max_chunks: usize,
    ) -> Result<RunOutcome> {
        let gate = Arc::new(ConcurrencyGate::new(max_chunks));
        let slot_pool = Arc::new(SlotPool::new(max_chunks));
        let mut join_set: JoinSet<Result<usize, (usize, UploadError)>> = JoinSet::new();
        let mut failure: Option<(usize, UploadError)> = None;

        info!(
            "[并发上传] id={}, file={}, 并发上限={}",
            task_id, file.file_name, max_chunks
        );

        'dispatch: loop {
            // 先收割已完成的 worker
            while let Some(result) = join_set.try_join_next() {
                if let Some(failed) = Self::collect_result(result) {
                    failure = Some(failed);
                    break 'dispatch;
                }
            }

            // 发车前停止检查
            if token.is_cancelled() {
                // 已发车的分片由子令牌级联取消
                while join_set.join_next().await.is_some() {}
                return Ok(RunOutcome::Cancelled);
            }
            if self.ctx.cancel.is_paused(task_id) {
                info!("任务已暂停，停止发车并等待在途分片: id={}", task_id);
                while let Some(result) = join_set.join_next().await {
                    let _ = Self::collect_result(result);
                }
                return Ok(RunOutcome::Paused);
            }

            // 取下一个待传分片
            let next_index = {
                let mut m = env.manager.lock().await;
                match m.next_pending() {
                    Some(index) => {
                        m.chunks_mut()[index].mark_uploading();
                        Some(index)
                    }
                    None => None,
                }
            };

            let chunk_index = match next_index {
                Some(index) => index,
                None => break 'dispatch,
            };

            // 并发闸门（取消令牌可打断等待）
            let permit = tokio::select! {
                _ = token.cancelled() => {
                    while join_set.join_next().await.is_some() {}
                    return Ok(RunOutcome::Cancelled);
                }
                permit = gate.acquire() => permit,
            };

            let worker_env = env.clone();
            let slot_pool_clone = slot_pool.clone();
            join_set.spawn(async move {
                let slot_id = slot_pool_clone.acquire();
                let result = upload_single_chunk(worker_env, chunk_index, slot_id).await;
                slot_pool_clone.release(slot_id);
                drop(permit);
                result.map(|_| chunk_index).map_err(|e| (chunk_index, e))
            });
        }

        // 等待在途分片跑完（失败传播不等待兄弟分片，但让它们自然结束）
        while let Some(result) = join_set.join_next().await {
            if let Some(failed) = Self::collect_result(result) {
                failure.get_or_insert(failed);
            }
        }

        if let Some((chunk_index, upload_error)) = failure {
            if matches!(upload_error, UploadError::Cancelled) || token.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let message = format!("分片 #{} 上传失败: {}", chunk_index, upload_error);
            error!("任务失败: id={}, {}", task_id, message);

            self.sync_chunks_into_task(&env.task, &env.manager).await;
            let mut t = env.task.lock().await;
            t.mark_error(message.clone());
            self.ctx.events.emit(UploadEvent::TaskError {
                task: t.snapshot(),
                error: message.clone(),
            });
            anyhow::bail!(message);
        }

        Ok(RunOutcome::Completed)
    }

    /// 解析 worker 结果；返回 Some 表示需记录的失败
    fn collect_result(
        result: Result<Result<usize, (usize, UploadError)>, tokio::task::JoinError>,
    ) -> Option<(usize, UploadError)> {
        match result {
            Ok(Ok(_)) => None,
            // 取消的分片不算失败，由外层统一判定
            Ok(Err((_, UploadError::Cancelled))) => None,
            Ok(Err(failed)) => Some(failed),
            Err(join_error) => {
                error!("分片任务异常退出: {}", join_error);
                Some((usize::MAX, UploadError::Network(join_error.to_string())))
            }
        }
    }

    /// 合并阶段
    #[allow(clippy::too_many_arguments)]
    async fn merge_chunks(
        &self,
        task_id: &str,
        file: &FileSource,
        task: &Arc<Mutex<UploadTask>>,
        manager: &Arc<Mutex<ChunkManager>>,
        token: &CancellationToken,
        config: &crate::config::UploadConfig,
        fingerprint: Option<&FileFingerprint>,
        checker: &DedupChecker,
        file_id: &str,
    ) -> Result<RunOutcome> {
        let (etags, total_chunks) = {
            let m = manager.lock().await;
            let etags = m
                .ordered_etags()
                .context("存在未完成分片，无法合并")?;
            (etags, m.chunk_count())
        };

        // 进度推进到 90，进入合并区间
        {
            let mut t = task.lock().await;
            let m = manager.lock().await;
            t.chunks = m.chunks().to_vec();
            t.refresh_uploaded_chunks();
            t.merging = true;
            self.ctx
                .events
                .emit(UploadEvent::TaskProgress { task: t.snapshot() });
        }

        let request = MergeRequest {
            file_id: file_id.to_string(),
            file_name: file.file_name.clone(),
            total_chunks,
            file_size: file.size,
            mime_type: None,
            etags,
        };

        info!("开始合并分片: id={}, chunks={}", task_id, total_chunks);

        let mut attempt = 0u32;
        let response = loop {
            let merge_future = self.ctx.transport.merge_chunks(request.clone());
            let result = tokio::select! {
                _ = token.cancelled() => Err(UploadError::Cancelled),
                merged = merge_future => merged,
            };

            match result {
                Ok(response) => break response,
                Err(UploadError::Cancelled) => return Ok(RunOutcome::Cancelled),
                Err(merge_error) => {
                    // 合并默认不重试（幂等性未知），retry_merge 打开后按策略重试
                    if config.retry_merge && self.retry.should_retry(&merge_error, attempt) {
                        let delay = self.retry.delay(attempt, &merge_error);
                        warn!(
                            "合并失败，{}ms 后重试 ({}): id={}, error={}",
                            delay.as_millis(),
                            attempt + 1,
                            task_id,
                            merge_error
                        );
                        attempt += 1;
                        tokio::select! {
                            _ = token.cancelled() => return Ok(RunOutcome::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }

                    let message = format!("合并分片失败: {}", merge_error);
                    error!("任务失败: id={}, {}", task_id, message);
                    let mut t = task.lock().await;
                    t.mark_error(message.clone());
                    self.ctx.events.emit(UploadEvent::TaskError {
                        task: t.snapshot(),
                        error: message.clone(),
                    });
                    anyhow::bail!(message);
                }
            }
        };

        // 成功：写秒传标记、清理续传快照
        if let Some(fp) = fingerprint {
            checker.write_marker(fp);
        }
        self.ctx.cache.remove(&resume_key(task_id));

        {
            let mut t = task.lock().await;
            t.mark_success(response.file, false);
            self.ctx.events.emit(UploadEvent::TaskSuccess {
                task: t.snapshot(),
                deduplicated: false,
            });
        }

        info!("上传完成: id={}, file={}", task_id, file.file_name);
        Ok(RunOutcome::Completed)
    }
}

// =====================================================
// 分片 worker
// =====================================================

/// 读取分片数据（阻塞线程池）
async fn read_chunk_data(path: &Path, start: u64, size: usize) -> Result<Vec<u8>, UploadError> {
    use std::io::{Read, Seek, SeekFrom};

    let path = path.to_path_buf();
    let handle = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, std::io::Error> {
        let mut file = std::fs::File::open(&path)?;
        file.seek(SeekFrom::Start(start))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    });

    match handle.await {
        Ok(Ok(buffer)) => Ok(buffer),
        Ok(Err(io_error)) => Err(UploadError::Io(io_error.to_string())),
        Err(join_error) => Err(UploadError::Io(join_error.to_string())),
    }
}

/// 上传单个分片（带分类重试）
async fn upload_single_chunk(
    env: ChunkUploadEnv,
    chunk_index: usize,
    slot_id: usize,
) -> Result<(), UploadError> {
    let task_id = {
        let t = env.task.lock().await;
        t.id.clone()
    };
    let chunk_token = env.ctx.cancel.chunk_token(&task_id, chunk_index);

    let (start, size) = {
        let m = env.manager.lock().await;
        let chunk = &m.chunks()[chunk_index];
        (chunk.start, chunk.size())
    };

    // 错峰发车：前三个分片立即发出，其余按配置延迟
    if chunk_index > 2 && !env.stagger.is_zero() {
        tokio::select! {
            _ = chunk_token.cancelled() => return Err(UploadError::Cancelled),
            _ = tokio::time::sleep(env.stagger) => {}
        }
    }

    debug!(
        "[上传槽位{}] 分片 #{} 开始 (偏移: {}, 大小: {} bytes)",
        slot_id, chunk_index, start, size
    );

    let data = read_chunk_data(&env.file_path, start, size as usize).await?;

    let mut attempt = 0u32;
    loop {
        if chunk_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let request = ChunkUploadRequest {
            data: data.clone(),
            index: chunk_index,
            size,
            total_chunks: env.total_chunks,
            file_id: env.file_id.clone(),
            file_name: env.file_name.clone(),
            file_size: env.file_size,
            custom_fields: env.custom_fields.clone(),
            timeout: env.timeout,
        };

        let started = Instant::now();
        let upload_future = env.ctx.transport.upload_chunk(request);
        let result = tokio::select! {
            _ = chunk_token.cancelled() => Err(UploadError::Cancelled),
            uploaded = upload_future => uploaded,
        };

        match result {
            Ok(response) => {
                let elapsed = started.elapsed();
                let speed_bps = env.task_speed.record(size, elapsed);
                env.ctx.adapt.record_speed(size, elapsed);

                let (completed, total) = {
                    let mut m = env.manager.lock().await;
                    m.chunks_mut()[chunk_index]
                        .mark_success(response.etag.clone(), elapsed.as_millis() as u64);
                    (m.completed_count(), m.chunk_count())
                };

                // 回写任务并发布事件
                {
                    let mut t = env.task.lock().await;
                    if let Some(chunk) = t.chunks.get_mut(chunk_index) {
                        chunk.mark_success(response.etag.clone(), elapsed.as_millis() as u64);
                    }
                    t.refresh_uploaded_chunks();
                    t.speed = env.task_speed.instant_bps() as u64;

                    env.ctx.events.emit(UploadEvent::ChunkSuccess {
                        chunk: ChunkEventSnapshot {
                            task_id: t.id.clone(),
                            index: chunk_index,
                            size,
                            retry_count: attempt,
                            error: None,
                        },
                    });
                    if env.throttler.should_emit() {
                        env.ctx
                            .events
                            .emit(UploadEvent::TaskProgress { task: t.snapshot() });
                    }
                }

                info!(
                    "[上传槽位{}] ✓ 分片 #{} 完成 ({}/{}, {:.0} KB/s)",
                    slot_id,
                    chunk_index,
                    completed,
                    total,
                    speed_bps / 1024.0
                );
                return Ok(());
            }
            Err(UploadError::Cancelled) => {
                debug!("[上传槽位{}] 分片 #{} 被取消", slot_id, chunk_index);
                return Err(UploadError::Cancelled);
            }
            Err(upload_error) => {
                if env.retry.should_retry(&upload_error, attempt) {
                    let delay = env.retry.delay(attempt, &upload_error);
                    warn!(
                        "[上传槽位{}] 分片 #{} 失败，{}ms 后重试 ({}): {}",
                        slot_id,
                        chunk_index,
                        delay.as_millis(),
                        attempt + 1,
                        upload_error
                    );

                    {
                        // 管理器中保持 Uploading 占位（防止重复派发），只记重试次数
                        let mut m = env.manager.lock().await;
                        let chunk = &mut m.chunks_mut()[chunk_index];
                        if chunk.status != ChunkStatus::Success {
                            chunk.retry_count += 1;
                            chunk.error = Some(upload_error.to_string());
                        }
                    }
                    {
                        // 任务镜像对观察者展示 Retrying
                        let mut t = env.task.lock().await;
                        if let Some(chunk) = t.chunks.get_mut(chunk_index) {
                            chunk.mark_retrying(upload_error.to_string());
                        }
                    }

                    attempt += 1;
                    tokio::select! {
                        _ = chunk_token.cancelled() => return Err(UploadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }

                // 重试预算耗尽或不可重试：分片终态失败
                error!(
                    "[上传槽位{}] 分片 #{} 终态失败: {}",
                    slot_id, chunk_index, upload_error
                );
                {
                    let mut m = env.manager.lock().await;
                    m.chunks_mut()[chunk_index].mark_error(upload_error.to_string());
                }
                {
                    let mut t = env.task.lock().await;
                    if let Some(chunk) = t.chunks.get_mut(chunk_index) {
                        chunk.mark_error(upload_error.to_string());
                    }
                    env.ctx.events.emit(UploadEvent::ChunkError {
                        chunk: ChunkEventSnapshot {
                            task_id: t.id.clone(),
                            index: chunk_index,
                            size,
                            retry_count: attempt,
                            error: Some(upload_error.to_string()),
                        },
                        error: upload_error.to_string(),
                    });
                }
                return Err(upload_error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::transport::{
        ChunkUploadResponse, ExistsRequest, ExistsResponse, MergeResponse, StoredFile,
        UploadTransport,
    };
    use crate::uploader::task::{TaskOptions, TaskStatus};
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    /// 可编排的内存传输：按分片索引注入失败脚本
    struct ScriptedTransport {
        /// chunk index -> 前 N 次调用返回的错误状态码
        failures: parking_lot::Mutex<HashMap<usize, Vec<u16>>>,
        chunk_calls: AtomicUsize,
        merge_calls: AtomicUsize,
        exists_calls: AtomicUsize,
        exists: bool,
        uploading_peak: AtomicUsize,
        uploading_now: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                failures: parking_lot::Mutex::new(HashMap::new()),
                chunk_calls: AtomicUsize::new(0),
                merge_calls: AtomicUsize::new(0),
                exists_calls: AtomicUsize::new(0),
                exists: false,
                uploading_peak: AtomicUsize::new(0),
                uploading_now: AtomicUsize::new(0),
                delay: Duration::from_millis(5),
            }
        }

        fn fail_chunk(self, index: usize, statuses: Vec<u16>) -> Self {
            self.failures.lock().insert(index, statuses);
            self
        }
    }

    #[async_trait]
    impl UploadTransport for ScriptedTransport {
        async fn upload_chunk(
            &self,
            request: ChunkUploadRequest,
        ) -> Result<ChunkUploadResponse, UploadError> {
            self.chunk_calls.fetch_add(1, Ordering::SeqCst);

            let now = self.uploading_now.fetch_add(1, Ordering::SeqCst) + 1;
            self.uploading_peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.uploading_now.fetch_sub(1, Ordering::SeqCst);

            let scripted = {
                let mut failures = self.failures.lock();
                failures
                    .get_mut(&request.index)
                    .and_then(|statuses| (!statuses.is_empty()).then(|| statuses.remove(0)))
            };
            if let Some(status) = scripted {
                return Err(UploadError::Status {
                    status,
                    message: "scripted failure".into(),
                });
            }

            Ok(ChunkUploadResponse {
                success: true,
                etag: format!("etag-{}", request.index),
                message: String::new(),
            })
        }

        async fn merge_chunks(&self, request: MergeRequest) -> Result<MergeResponse, UploadError> {
            self.merge_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.etags.len(), request.total_chunks);
            Ok(MergeResponse {
                success: true,
                file: Some(StoredFile {
                    url: format!("https://cdn.example.com/{}", request.file_name),
                    thumbnail: None,
                    doc_id: Some("doc-1".into()),
                }),
                message: String::new(),
            })
        }

        async fn check_exists(
            &self,
            _request: ExistsRequest,
        ) -> Result<ExistsResponse, UploadError> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExistsResponse {
                exists: self.exists,
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
        config.upload.max_retry_delay_ms = 5;
        config.upload.enable_adaptation = false;
        config
    }

    fn make_task(temp: &NamedTempFile) -> Arc<Mutex<UploadTask>> {
        let source = FileSource::from_path(temp.path()).unwrap();
        Arc::new(Mutex::new(UploadTask::new(source, TaskOptions::default())))
    }

    fn temp_file(size: usize) -> NamedTempFile {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&vec![0x5Au8; size]).unwrap();
        temp.flush().unwrap();
        temp
    }

    async fn register(ctx: &Arc<UploadContext>, task: &Arc<Mutex<UploadTask>>) -> String {
        let id = task.lock().await.id.clone();
        ctx.cancel.register_task(&id);
        id
    }

    #[tokio::test]
    async fn test_full_upload_flow() {
        let temp = temp_file(4096 + 100); // 5 个分片（1024 * 4 + 100）
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = UploadContext::new(test_config(), transport.clone());
        let task = make_task(&temp);
        register(&ctx, &task).await;

        let unit = ChunkTransferUnit::with_default_retry(ctx.clone());
        let outcome = unit.run(task.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        let t = task.lock().await;
        assert_eq!(t.status, TaskStatus::Success);
        assert_eq!(t.progress(), 100);
        assert_eq!(t.uploaded_chunks, 5);
        assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 5);
        assert_eq!(transport.merge_calls.load(Ordering::SeqCst), 1);
        assert!(t.result.is_some());
    }

    #[tokio::test]
    async fn test_500_twice_then_success_three_attempts() {
        let temp = temp_file(1024); // 单分片
        let transport = Arc::new(ScriptedTransport::new().fail_chunk(0, vec![500, 500]));
        let ctx = UploadContext::new(test_config(), transport.clone());
        let task = make_task(&temp);
        register(&ctx, &task).await;

        let unit = ChunkTransferUnit::with_default_retry(ctx.clone());
        let outcome = unit.run(task.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        // 两次 500 + 一次成功 = 3 次分片请求
        assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 3);
        assert_eq!(task.lock().await.status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn test_404_no_retry_task_error() {
        let temp = temp_file(1024);
        let transport = Arc::new(ScriptedTransport::new().fail_chunk(0, vec![404]));
        let ctx = UploadContext::new(test_config(), transport.clone());
        let task = make_task(&temp);
        register(&ctx, &task).await;

        let unit = ChunkTransferUnit::with_default_retry(ctx.clone());
        let result = unit.run(task.clone()).await;

        assert!(result.is_err());
        // 404 不重试：只有一次分片请求
        assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 1);
        let t = task.lock().await;
        assert_eq!(t.status, TaskStatus::Error);
        // 任务级 retry_count 不受影响
        assert_eq!(t.retry_count, 0);
        assert_eq!(transport.merge_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dedup_cache_hit_zero_chunk_requests() {
        let temp = temp_file(2048);
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = UploadContext::new(test_config(), transport.clone());
        let task = make_task(&temp);
        register(&ctx, &task).await;

        // 预置秒传标记
        let source = task.lock().await.file.clone();
        let token = CancellationToken::new();
        let fingerprint = crate::uploader::fingerprint::compute_fingerprint(&source, &token)
            .await
            .unwrap();
        let checker = DedupChecker::new(transport.clone(), ctx.cache.clone(), true);
        checker.write_marker(&fingerprint);

        let unit = ChunkTransferUnit::with_default_retry(ctx.clone());
        let outcome = unit.run(task.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        let t = task.lock().await;
        assert_eq!(t.status, TaskStatus::Success);
        assert!(t.deduplicated);
        // 零分片请求、零合并请求、零存在性请求（缓存直接命中）
        assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.merge_calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.exists_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let temp = temp_file(1024 * 12); // 12 个分片
        let transport = Arc::new(ScriptedTransport::new());
        let mut config = test_config();
        config.upload.max_concurrent_chunks = 3;
        let ctx = UploadContext::new(config, transport.clone());
        let task = make_task(&temp);
        register(&ctx, &task).await;

        let unit = ChunkTransferUnit::with_default_retry(ctx.clone());
        unit.run(task.clone()).await.unwrap();

        assert!(transport.uploading_peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_resume_skips_success_chunks() {
        let temp = temp_file(1024 * 10); // 10 个分片
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = UploadContext::new(test_config(), transport.clone());
        let task = make_task(&temp);
        register(&ctx, &task).await;

        // 模拟此前已完成 4 个分片后暂停
        {
            let mut t = task.lock().await;
            t.chunks = crate::uploader::chunk::plan_chunks(1024 * 10, 1024);
            for index in 0..4 {
                t.chunks[index].mark_success(format!("etag-{}", index), 5);
            }
            t.refresh_uploaded_chunks();
        }

        let unit = ChunkTransferUnit::with_default_retry(ctx.clone());
        let outcome = unit.run(task.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Completed);
        // 只重新派发剩余 6 个分片
        assert_eq!(transport.chunk_calls.load(Ordering::SeqCst), 6);
        assert_eq!(task.lock().await.uploaded_chunks, 10);
    }

    #[tokio::test]
    async fn test_cancel_silently_aborts() {
        let temp = temp_file(1024 * 8);
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = UploadContext::new(test_config(), transport.clone());
        let task = make_task(&temp);
        let task_id = register(&ctx, &task).await;

        // 进入 run 前取消
        ctx.cancel.cancel_task(&task_id);

        let error_events = Arc::new(AtomicUsize::new(0));
        let error_events_clone = error_events.clone();
        ctx.events.subscribe(move |event| {
            if matches!(event, UploadEvent::TaskError { .. }) {
                error_events_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let unit = ChunkTransferUnit::with_default_retry(ctx.clone());
        let outcome = unit.run(task.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        // 取消永不走错误回调
        assert_eq!(error_events.load(Ordering::SeqCst), 0);
        let t = task.lock().await;
        assert_ne!(t.status, TaskStatus::Success);
        assert_ne!(t.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_pause_persists_snapshot() {
        let temp = temp_file(1024 * 10);
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = UploadContext::new(test_config(), transport.clone());
        let task = make_task(&temp);
        let task_id = register(&ctx, &task).await;

        // 立即暂停：发车循环第一轮即应停住
        ctx.cancel.pause(&task_id);

        let unit = ChunkTransferUnit::with_default_retry(ctx.clone());
        let outcome = unit.run(task.clone()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Paused);
        // 续传快照已写入缓存
        assert!(ctx.cache.get(&resume_key(&task_id)).is_some());
    }
}
