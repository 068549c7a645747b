// 传输层类型定义
//
// 三个服务端接口的请求/响应结构 + 统一的上传错误类型

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 分片上传请求
///
/// multipart 载荷：分片二进制 + 元数据字段 + 调用方自定义字段
#[derive(Debug, Clone)]
pub struct ChunkUploadRequest {
    /// 分片数据
    pub data: Vec<u8>,
    /// 分片索引（0 起）
    pub index: usize,
    /// 分片大小（字节）
    pub size: u64,
    /// 总分片数
    pub total_chunks: usize,
    /// 文件指纹（内容哈希）
    pub file_id: String,
    /// 原始文件名
    pub file_name: String,
    /// 文件总大小
    pub file_size: u64,
    /// 调用方自定义表单字段
    pub custom_fields: HashMap<String, String>,
    /// 本次请求超时
    pub timeout: Duration,
}

/// 分片上传响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkUploadResponse {
    /// 是否成功
    #[serde(default)]
    pub success: bool,
    /// 分片确认令牌（etag 等价物），合并时按序回传
    #[serde(default)]
    pub etag: String,
    /// 失败时的说明
    #[serde(default)]
    pub message: String,
}

/// 合并请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    /// 文件指纹
    pub file_id: String,
    /// 文件名
    pub file_name: String,
    /// 总分片数
    pub total_chunks: usize,
    /// 文件大小
    pub file_size: u64,
    /// MIME 类型（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// 按分片索引排序的确认令牌列表
    pub etags: Vec<String>,
}

/// 服务端已存储文件的引用
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredFile {
    /// 文件访问地址
    pub url: String,
    /// 缩略图地址（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// 服务端分配的文档 ID（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

/// 合并响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResponse {
    #[serde(default)]
    pub success: bool,
    /// 合并后的文件引用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<StoredFile>,
    #[serde(default)]
    pub message: String,
}

/// 存在性检查（秒传）请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsRequest {
    /// 文件指纹
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
}

/// 存在性检查响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistsResponse {
    /// 服务端是否已有同指纹文件
    #[serde(default)]
    pub exists: bool,
    /// 已存储文件的引用（exists 为 true 时）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<StoredFile>,
}

/// 上传错误
///
/// 重试策略引擎据此分类；Cancelled 永不重试且不计入错误回调
#[derive(Debug, Clone, thiserror::Error)]
pub enum UploadError {
    /// 连接层失败，无状态码
    #[error("网络错误: {0}")]
    Network(String),

    /// 请求超时
    #[error("请求超时")]
    Timeout,

    /// 服务端返回非 2xx 状态码
    #[error("服务端错误: status={status}, message={message}")]
    Status { status: u16, message: String },

    /// 已取消（取消令牌触发）
    #[error("操作已取消")]
    Cancelled,

    /// 响应体不符合协议
    #[error("响应解析失败: {0}")]
    Protocol(String),

    /// 本地 IO 失败（读取分片数据等）
    #[error("本地 IO 错误: {0}")]
    Io(String),
}

impl UploadError {
    /// 状态码（仅 Status 变体有）
    pub fn status_code(&self) -> Option<u16> {
        match self {
            UploadError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 从 reqwest 错误转换
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return UploadError::Timeout;
        }
        if let Some(status) = err.status() {
            return UploadError::Status {
                status: status.as_u16(),
                message: err.to_string(),
            };
        }
        UploadError::Network(err.to_string())
    }
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Io(err.to_string())
    }
}
