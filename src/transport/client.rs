// HTTP 传输实现
//
// 分片上传走 multipart（分片二进制 + 元数据字段），
// 合并与存在性检查走 JSON POST

use crate::config::EndpointConfig;
use crate::transport::types::{
    ChunkUploadRequest, ChunkUploadResponse, ExistsRequest, ExistsResponse, MergeRequest,
    MergeResponse, UploadError,
};
use async_trait::async_trait;
use reqwest::multipart;
use std::time::Duration;
use tracing::{debug, error, info};

/// 上传传输接口
///
/// 引擎只通过此 trait 触达服务端，测试用内存实现替换
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 上传单个分片，返回分片确认令牌
    async fn upload_chunk(&self, request: ChunkUploadRequest)
        -> Result<ChunkUploadResponse, UploadError>;

    /// 请求服务端合并全部分片
    async fn merge_chunks(&self, request: MergeRequest) -> Result<MergeResponse, UploadError>;

    /// 存在性检查（秒传探测）
    async fn check_exists(&self, request: ExistsRequest) -> Result<ExistsResponse, UploadError>;
}

/// 合并/存在性检查请求的默认超时（秒）
const CONTROL_REQUEST_TIMEOUT_SECS: u64 = 30;

/// 基于 reqwest 的 HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: EndpointConfig,
}

impl HttpTransport {
    pub fn new(endpoints: EndpointConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(UploadError::from_reqwest)?;
        Ok(Self { client, endpoints })
    }

    pub fn with_client(client: reqwest::Client, endpoints: EndpointConfig) -> Self {
        Self { client, endpoints }
    }
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn upload_chunk(
        &self,
        request: ChunkUploadRequest,
    ) -> Result<ChunkUploadResponse, UploadError> {
        debug!(
            "上传分片: file_id={}, index={}/{}, size={} bytes",
            request.file_id, request.index, request.total_chunks, request.size
        );

        // 构建 multipart form
        let part = multipart::Part::bytes(request.data)
            .file_name(request.file_name.clone())
            .mime_str("application/octet-stream")
            .map_err(UploadError::from_reqwest)?;

        let mut form = multipart::Form::new()
            .part("chunk", part)
            .text("index", request.index.to_string())
            .text("size", request.size.to_string())
            .text("total_chunks", request.total_chunks.to_string())
            .text("file_id", request.file_id.clone())
            .text("file_name", request.file_name.clone())
            .text("file_size", request.file_size.to_string());

        for (key, value) in request.custom_fields {
            form = form.text(key, value);
        }

        let response = self
            .client
            .post(&self.endpoints.chunk_upload_url)
            .timeout(request.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(UploadError::from_reqwest)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(UploadError::from_reqwest)?;

        if !status.is_success() {
            error!(
                "分片上传失败: index={}, status={}, body={}",
                request.index, status, body
            );
            return Err(UploadError::Status {
                status: status.as_u16(),
                message: body,
            });
        }

        let chunk_response: ChunkUploadResponse = serde_json::from_str(&body)
            .map_err(|e| UploadError::Protocol(format!("分片响应解析失败: {} (body={})", e, body)))?;

        if !chunk_response.success {
            return Err(UploadError::Protocol(format!(
                "分片上传被服务端拒绝: {}",
                chunk_response.message
            )));
        }

        debug!(
            "分片上传成功: index={}, etag={}",
            request.index, chunk_response.etag
        );
        Ok(chunk_response)
    }

    async fn merge_chunks(&self, request: MergeRequest) -> Result<MergeResponse, UploadError> {
        info!(
            "请求合并分片: file_id={}, file_name={}, chunks={}",
            request.file_id, request.file_name, request.total_chunks
        );

        let response = self
            .client
            .post(&self.endpoints.merge_url)
            .timeout(Duration::from_secs(CONTROL_REQUEST_TIMEOUT_SECS))
            .json(&request)
            .send()
            .await
            .map_err(UploadError::from_reqwest)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(UploadError::from_reqwest)?;

        if !status.is_success() {
            error!(
                "合并请求失败: file_id={}, status={}, body={}",
                request.file_id, status, body
            );
            return Err(UploadError::Status {
                status: status.as_u16(),
                message: body,
            });
        }

        let merge_response: MergeResponse = serde_json::from_str(&body)
            .map_err(|e| UploadError::Protocol(format!("合并响应解析失败: {} (body={})", e, body)))?;

        if !merge_response.success {
            return Err(UploadError::Protocol(format!(
                "合并被服务端拒绝: {}",
                merge_response.message
            )));
        }

        info!("合并完成: file_id={}", request.file_id);
        Ok(merge_response)
    }

    async fn check_exists(&self, request: ExistsRequest) -> Result<ExistsResponse, UploadError> {
        debug!(
            "存在性检查: file_id={}, file_name={}",
            request.file_id, request.file_name
        );

        let response = self
            .client
            .post(&self.endpoints.exists_url)
            .timeout(Duration::from_secs(CONTROL_REQUEST_TIMEOUT_SECS))
            .json(&request)
            .send()
            .await
            .map_err(UploadError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Status {
                status: status.as_u16(),
                message: body,
            });
        }

        let exists_response: ExistsResponse = response
            .json()
            .await
            .map_err(|e| UploadError::Protocol(format!("存在性检查响应解析失败: {}", e)))?;

        debug!(
            "存在性检查结果: file_id={}, exists={}",
            request.file_id, exists_response.exists
        );
        Ok(exists_response)
    }
}
