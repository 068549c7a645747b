// 上传任务定义
//
// 状态机：
//   Pending -> Uploading -> { Success | Error | Paused | Cancelled }
//   Paused -> Pending（恢复重新入队）
//   Error  -> Pending（手动重试重新入队）
// Success 与 Cancelled 为终态；Error 可被手动重试，属于"软终态"

use crate::events::TaskSnapshot;
use crate::transport::StoredFile;
use crate::uploader::chunk::{ChunkInfo, ChunkStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待调度
    Pending,
    /// 上传中
    Uploading,
    /// 成功（终态）
    Success,
    /// 失败（软终态，可手动重试）
    Error,
    /// 已暂停
    Paused,
    /// 已取消（终态）
    Cancelled,
}

impl TaskStatus {
    /// 是否为不可再调度的终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// 任务优先级（队列排序：High > Normal > Low，同级按文件大小升序）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// 待上传文件源
///
/// 大小与修改时间在入队时固化，参与去重指纹
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSource {
    /// 本地路径
    pub path: PathBuf,
    /// 文件名
    pub file_name: String,
    /// 文件大小（字节）
    pub size: u64,
    /// 最后修改时间（Unix 毫秒）
    pub modified_ms: i64,
}

impl FileSource {
    /// 从本地文件构造，读取元数据
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path: PathBuf = path.into();
        let metadata = std::fs::metadata(&path)?;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0);
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self {
            path,
            file_name,
            size: metadata.len(),
            modified_ms,
        })
    }

    /// 小写扩展名（不含点），无扩展名时为空串
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }
}

/// 任务级选项（覆盖全局配置）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    /// 分片大小覆盖
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    /// 最大重试次数覆盖
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// 附加到每个分片请求的自定义表单字段
    #[serde(default)]
    pub custom_fields: HashMap<String, String>,
    /// 优先级
    #[serde(default)]
    pub priority: TaskPriority,
}

/// 上传任务
///
/// 所有权：chunks 数组只由该任务的分片传输单元在自身执行上下文内修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务 ID（生命周期内稳定）
    pub id: String,
    /// 文件源
    pub file: FileSource,
    /// 任务状态
    pub status: TaskStatus,
    /// 分片列表（按 index 升序，精确划分 [0, file.size)）
    pub chunks: Vec<ChunkInfo>,
    /// 已成功分片数（单调不减，等于 Success 分片计数）
    pub uploaded_chunks: usize,
    /// 任务级重试计数（手动重试时递增）
    pub retry_count: u32,
    /// 优先级
    pub priority: TaskPriority,
    /// 任务级选项
    pub options: TaskOptions,
    /// 成功后的服务端文件引用（缓存标记秒传命中时可能缺失）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StoredFile>,
    /// 终态失败的错误信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 是否为秒传命中
    #[serde(default)]
    pub deduplicated: bool,
    /// 当前是否处于合并阶段（进度映射 90-100 区间）
    #[serde(default)]
    pub merging: bool,
    /// 瞬时速度 (bytes/s)
    pub speed: u64,

    // === 时间戳（Unix 毫秒） ===
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl UploadTask {
    /// 创建新任务
    pub fn new(file: FileSource, options: TaskOptions) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file,
            status: TaskStatus::Pending,
            chunks: Vec::new(),
            uploaded_chunks: 0,
            retry_count: 0,
            priority: options.priority,
            options,
            result: None,
            error: None,
            deduplicated: false,
            merging: false,
            speed: 0,
            created_at: now_ms(),
            started_at: None,
            paused_at: None,
            resumed_at: None,
            finished_at: None,
        }
    }

    /// 已上传字节数（Success 分片大小之和）
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::Success)
            .map(|chunk| chunk.size())
            .sum()
    }

    /// 进度百分比（0-100 整数）
    ///
    /// 分片阶段映射到 0-90，合并阶段映射到 90-100
    pub fn progress(&self) -> u8 {
        match self.status {
            TaskStatus::Success => return 100,
            TaskStatus::Pending if self.chunks.is_empty() => return 0,
            _ => {}
        }

        if self.merging {
            return 90;
        }

        if self.file.size == 0 || self.chunks.is_empty() {
            return 0;
        }

        let ratio = self.uploaded_bytes() as f64 / self.file.size as f64;
        (ratio * 90.0).round().min(90.0) as u8
    }

    /// 估算剩余时间（秒）
    pub fn eta(&self) -> Option<u64> {
        let uploaded = self.uploaded_bytes();
        if self.speed == 0 || uploaded >= self.file.size {
            return None;
        }
        Some((self.file.size - uploaded) / self.speed)
    }

    /// 同步 uploaded_chunks 计数（单调不减）
    pub fn refresh_uploaded_chunks(&mut self) {
        let success_count = self
            .chunks
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::Success)
            .count();
        if success_count > self.uploaded_chunks {
            self.uploaded_chunks = success_count;
        }
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = TaskStatus::Uploading;
        if self.started_at.is_none() {
            self.started_at = Some(now_ms());
        }
    }

    /// 标记为成功
    pub fn mark_success(&mut self, result: Option<StoredFile>, deduplicated: bool) {
        self.status = TaskStatus::Success;
        self.result = result;
        self.deduplicated = deduplicated;
        self.merging = false;
        self.error = None;
        self.finished_at = Some(now_ms());
        if deduplicated {
            // 秒传：全部分片视为完成
            self.uploaded_chunks = self.chunks.len();
        }
    }

    /// 标记为失败
    pub fn mark_error(&mut self, error: String) {
        self.status = TaskStatus::Error;
        self.error = Some(error);
        self.merging = false;
        self.finished_at = Some(now_ms());
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
        self.paused_at = Some(now_ms());
    }

    /// 恢复：Paused -> Pending，重新入队
    pub fn mark_resumed(&mut self) {
        self.status = TaskStatus::Pending;
        self.resumed_at = Some(now_ms());
    }

    /// 标记为取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.merging = false;
        self.finished_at = Some(now_ms());
    }

    /// 手动重试：Error -> Pending，只重置非 Success 分片
    pub fn prepare_retry(&mut self, priority: TaskPriority) {
        self.status = TaskStatus::Pending;
        self.priority = priority;
        self.error = None;
        self.finished_at = None;
        self.retry_count += 1;
        for chunk in &mut self.chunks {
            chunk.reset_if_not_success();
        }
    }

    /// 生成事件快照
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            file_name: self.file.file_name.clone(),
            file_size: self.file.size,
            status: self.status.as_str().to_string(),
            progress: self.progress(),
            uploaded_chunks: self.uploaded_chunks,
            total_chunks: self.chunks.len(),
            speed: self.speed,
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::chunk::plan_chunks;

    fn sample_file(size: u64) -> FileSource {
        FileSource {
            path: PathBuf::from("./test/sample.bin"),
            file_name: "sample.bin".to_string(),
            size,
            modified_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_task_creation() {
        let task = UploadTask::new(sample_file(1024), TaskOptions::default());

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.uploaded_chunks, 0);
        assert_eq!(task.progress(), 0);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert!(!task.deduplicated);
    }

    #[test]
    fn test_progress_chunk_phase_maps_to_90() {
        let mut task = UploadTask::new(sample_file(1000), TaskOptions::default());
        task.chunks = plan_chunks(1000, 250);
        assert_eq!(task.chunks.len(), 4);

        // 完成一半字节 -> 45%
        task.chunks[0].mark_success("e0".into(), 10);
        task.chunks[1].mark_success("e1".into(), 10);
        task.refresh_uploaded_chunks();
        assert_eq!(task.progress(), 45);

        // 全部分片完成 -> 90%（还差合并）
        task.chunks[2].mark_success("e2".into(), 10);
        task.chunks[3].mark_success("e3".into(), 10);
        task.refresh_uploaded_chunks();
        assert_eq!(task.progress(), 90);

        task.merging = true;
        assert_eq!(task.progress(), 90);

        task.mark_success(
            Some(StoredFile {
                url: "https://example.com/sample.bin".into(),
                thumbnail: None,
                doc_id: None,
            }),
            false,
        );
        assert_eq!(task.progress(), 100);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = UploadTask::new(sample_file(1000), TaskOptions::default());

        task.mark_uploading();
        assert_eq!(task.status, TaskStatus::Uploading);
        assert!(task.started_at.is_some());

        task.mark_paused();
        assert_eq!(task.status, TaskStatus::Paused);
        assert!(task.paused_at.is_some());

        task.mark_resumed();
        assert_eq!(task.status, TaskStatus::Pending);

        task.mark_error("网络错误".to_string());
        assert_eq!(task.status, TaskStatus::Error);
        assert!(!task.status.is_terminal());

        task.mark_cancelled();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.status.is_terminal());
    }

    #[test]
    fn test_prepare_retry_resets_only_failed_chunks() {
        let mut task = UploadTask::new(sample_file(1000), TaskOptions::default());
        task.chunks = plan_chunks(1000, 250);

        task.chunks[0].mark_success("e0".into(), 10);
        task.chunks[1].mark_error("500".into());
        task.refresh_uploaded_chunks();
        task.mark_error("分片失败".to_string());

        task.prepare_retry(TaskPriority::High);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.retry_count, 1);
        assert!(task.error.is_none());
        // Success 分片不回退
        assert_eq!(task.chunks[0].status, ChunkStatus::Success);
        assert_eq!(task.chunks[1].status, ChunkStatus::Pending);
    }

    #[test]
    fn test_uploaded_chunks_monotonic() {
        let mut task = UploadTask::new(sample_file(1000), TaskOptions::default());
        task.chunks = plan_chunks(1000, 500);

        task.chunks[0].mark_success("e0".into(), 10);
        task.refresh_uploaded_chunks();
        assert_eq!(task.uploaded_chunks, 1);

        // 再次刷新不回退
        task.refresh_uploaded_chunks();
        assert_eq!(task.uploaded_chunks, 1);
    }

    #[test]
    fn test_eta() {
        let mut task = UploadTask::new(sample_file(1000), TaskOptions::default());
        task.chunks = plan_chunks(1000, 500);
        task.chunks[0].mark_success("e0".into(), 10);

        task.speed = 100;
        assert_eq!(task.eta(), Some(5)); // (1000 - 500) / 100

        task.speed = 0;
        assert_eq!(task.eta(), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::High < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::Low);
    }
}
