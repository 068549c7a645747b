// 分片模型与划分
//
// - plan_chunks: 把 [0, file_size) 精确划分为无缝隙、无重叠的字节区间
// - optimal_chunk_size: 纯函数，由文件大小 + 实测吞吐 + 配置边界推导分片大小
// - ChunkManager: 持有一个任务的分片数组，状态推进保证 Success 不回退

use crate::config::UploadConfig;
use bit_set::BitSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 分片数量软上限：超过则放大分片，避免海量小请求
const TARGET_MAX_CHUNKS: u64 = 1000;

/// 自适应分片的目标传输时长（秒）：一个分片在实测速度下约传这么久
const TARGET_CHUNK_SECONDS: f64 = 5.0;

/// 分片状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// 等待上传
    Pending,
    /// 上传中
    Uploading,
    /// 已成功（不可回退）
    Success,
    /// 终态失败
    Error,
    /// 等待重试
    Retrying,
}

/// 分片信息
///
/// 不变量：每个 index 在 [0, total_chunks) 内恰有一个分片；
/// 状态一旦为 Success 就不再回退（恢复时幂等跳过）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// 分片索引（0 起，决定合并顺序）
    pub index: usize,
    /// 起始偏移（含）
    pub start: u64,
    /// 结束偏移（不含）
    pub end: u64,
    /// 分片状态
    pub status: ChunkStatus,
    /// 重试次数
    pub retry_count: u32,
    /// 上传耗时（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_time_ms: Option<u64>,
    /// 服务端确认令牌
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// 失败信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChunkInfo {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            status: ChunkStatus::Pending,
            retry_count: 0,
            upload_time_ms: None,
            etag: None,
            error: None,
        }
    }

    /// 分片大小（字节）
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// 标记成功（幂等；Success 不可被其他状态覆盖）
    pub fn mark_success(&mut self, etag: String, upload_time_ms: u64) {
        if self.status == ChunkStatus::Success {
            return;
        }
        self.status = ChunkStatus::Success;
        self.etag = Some(etag);
        self.upload_time_ms = Some(upload_time_ms);
        self.error = None;
    }

    /// 标记上传中（Success 不回退）
    pub fn mark_uploading(&mut self) {
        if self.status != ChunkStatus::Success {
            self.status = ChunkStatus::Uploading;
        }
    }

    /// 标记等待重试
    pub fn mark_retrying(&mut self, error: String) {
        if self.status != ChunkStatus::Success {
            self.status = ChunkStatus::Retrying;
            self.retry_count += 1;
            self.error = Some(error);
        }
    }

    /// 标记终态失败
    pub fn mark_error(&mut self, error: String) {
        if self.status != ChunkStatus::Success {
            self.status = ChunkStatus::Error;
            self.error = Some(error);
        }
    }

    /// 非 Success 分片复位为 Pending（手动重试、恢复时使用）
    pub fn reset_if_not_success(&mut self) {
        if self.status != ChunkStatus::Success {
            self.status = ChunkStatus::Pending;
            self.error = None;
        }
    }
}

/// 把文件划分为分片
///
/// 保证：分片按 index 升序，半开区间首尾相接，精确覆盖 [0, file_size)
pub fn plan_chunks(file_size: u64, chunk_size: u64) -> Vec<ChunkInfo> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut offset = 0u64;
    let mut index = 0usize;

    while offset < file_size {
        let end = (offset + chunk_size).min(file_size);
        chunks.push(ChunkInfo::new(index, offset, end));
        offset = end;
        index += 1;
    }

    chunks
}

/// 总分片数 = ceil(file_size / chunk_size)
pub fn chunk_count(file_size: u64, chunk_size: u64) -> usize {
    file_size.div_ceil(chunk_size.max(1)) as usize
}

/// 计算最优分片大小（纯函数）
///
/// # 参数
/// * `file_size` - 文件大小
/// * `avg_speed_bps` - 实测平均吞吐（bytes/s），无历史时为 None
/// * `config` - 提供 chunk_size 默认值与 min/max 边界
///
/// # 算法
/// 1. 无速度历史时使用配置默认值
/// 2. 有历史时令分片约在 TARGET_CHUNK_SECONDS 秒内传完（慢网小分片、快网大分片）
/// 3. 钳制到 [min_chunk_size, max_chunk_size]
/// 4. 分片数超过软上限时放大分片
/// 5. 文件不大于下限时整个文件作为单一分片
pub fn optimal_chunk_size(file_size: u64, avg_speed_bps: Option<f64>, config: &UploadConfig) -> u64 {
    if file_size <= config.min_chunk_size {
        return file_size.max(1);
    }

    let mut chunk_size = match avg_speed_bps {
        Some(speed) if speed > 0.0 => (speed * TARGET_CHUNK_SECONDS) as u64,
        _ => config.chunk_size,
    };

    chunk_size = chunk_size
        .clamp(config.min_chunk_size, config.max_chunk_size)
        .max(1);

    // 分片数量过多时放大分片
    let estimated = file_size.div_ceil(chunk_size);
    if estimated > TARGET_MAX_CHUNKS {
        chunk_size = (file_size.div_ceil(TARGET_MAX_CHUNKS)).min(config.max_chunk_size);
    }

    chunk_size
}

/// 断点续传快照（写入缓存的载荷）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSnapshot {
    /// 划分时使用的分片大小
    pub chunk_size: u64,
    /// 总分片数
    pub total_chunks: usize,
    /// 已成功分片索引
    pub completed: Vec<usize>,
    /// 已成功分片的确认令牌（与 completed 对齐）
    pub etags: Vec<String>,
}

/// 分片管理器
///
/// 一个任务的分片数组由其传输单元独占；管理器只在该执行上下文中被修改
#[derive(Debug)]
pub struct ChunkManager {
    chunks: Vec<ChunkInfo>,
    total_size: u64,
    chunk_size: u64,
}

impl ChunkManager {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        let chunks = plan_chunks(total_size, chunk_size);
        info!(
            "创建分片管理器: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );
        Self {
            chunks,
            total_size,
            chunk_size,
        }
    }

    /// 用已有分片数组恢复（任务恢复场景）
    pub fn from_chunks(chunks: Vec<ChunkInfo>, total_size: u64, chunk_size: u64) -> Self {
        Self {
            chunks,
            total_size,
            chunk_size,
        }
    }

    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut [ChunkInfo] {
        &mut self.chunks
    }

    pub fn into_chunks(self) -> Vec<ChunkInfo> {
        self.chunks
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 下一个待上传分片的索引（跳过 Success / Uploading）
    pub fn next_pending(&self) -> Option<usize> {
        self.chunks
            .iter()
            .find(|chunk| {
                matches!(chunk.status, ChunkStatus::Pending | ChunkStatus::Retrying)
            })
            .map(|chunk| chunk.index)
    }

    pub fn completed_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::Success)
            .count()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::Success)
            .map(|chunk| chunk.size())
            .sum()
    }

    pub fn is_completed(&self) -> bool {
        self.chunks
            .iter()
            .all(|chunk| chunk.status == ChunkStatus::Success)
    }

    /// 上传中的分片数（并发上限校验用）
    pub fn uploading_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::Uploading)
            .count()
    }

    /// 按 index 顺序收集全部确认令牌；存在未成功分片时返回 None
    pub fn ordered_etags(&self) -> Option<Vec<String>> {
        self.chunks
            .iter()
            .map(|chunk| chunk.etag.clone())
            .collect()
    }

    /// 生成续传快照
    pub fn snapshot(&self) -> ChunkSnapshot {
        let mut completed = Vec::new();
        let mut etags = Vec::new();
        for chunk in &self.chunks {
            if chunk.status == ChunkStatus::Success {
                completed.push(chunk.index);
                etags.push(chunk.etag.clone().unwrap_or_default());
            }
        }
        ChunkSnapshot {
            chunk_size: self.chunk_size,
            total_chunks: self.chunks.len(),
            completed,
            etags,
        }
    }

    /// 从快照恢复已完成分片
    ///
    /// 快照与当前划分不一致（分片大小或数量不同）时拒绝恢复
    pub fn restore(&mut self, snapshot: &ChunkSnapshot) -> bool {
        if snapshot.chunk_size != self.chunk_size || snapshot.total_chunks != self.chunks.len() {
            debug!(
                "续传快照与当前划分不一致，忽略: snapshot={}x{} bytes, current={}x{} bytes",
                snapshot.total_chunks,
                snapshot.chunk_size,
                self.chunks.len(),
                self.chunk_size
            );
            return false;
        }

        let mut completed_set = BitSet::with_capacity(self.chunks.len());
        for &index in &snapshot.completed {
            completed_set.insert(index);
        }

        let mut restored = 0;
        for (position, &index) in snapshot.completed.iter().enumerate() {
            if let Some(chunk) = self.chunks.get_mut(index) {
                let etag = snapshot.etags.get(position).cloned().unwrap_or_default();
                chunk.mark_success(etag, 0);
                restored += 1;
            }
        }

        info!(
            "从续传快照恢复 {} 个已完成分片（共 {} 个）",
            restored,
            self.chunks.len()
        );
        // BitSet 用于校验快照本身无重复索引
        restored == completed_set.len()
    }
}
